//! Deterministic blob locations.
//!
//! Everything a tender owns lives below `tenders/{org}/{tender}/`. Stage intermediates are
//! addressed by document hash so that re-uploads of identical bytes find existing outputs.

pub const ARTIFACT_FILE_NAME: &str = "index.v1.tar.gz";
pub const PAGES_FILE_NAME: &str = "pages.json.gz";
pub const CHUNKS_FILE_NAME: &str = "chunks.jsonl.gz";
pub const PARTIAL_EMBEDDINGS_FILE_NAME: &str = "embeddings.partial.bin";
pub const SUMMARY_FILE_NAME: &str = "summary.txt";

pub fn tender_prefix(org_id: &str, tender_id: &str) -> String {
    format!("tenders/{org_id}/{tender_id}")
}

pub fn upload_key(org_id: &str, tender_id: &str, upload_id: &str, file_name: &str) -> String {
    format!(
        "{}/uploads/{upload_id}/{}",
        tender_prefix(org_id, tender_id),
        sanitize_file_name(file_name)
    )
}

pub fn raw_key(org_id: &str, tender_id: &str, doc_hash: &str, file_name: &str) -> String {
    format!(
        "{}/raw/{doc_hash}/{}",
        tender_prefix(org_id, tender_id),
        sanitize_file_name(file_name)
    )
}

pub fn work_prefix(org_id: &str, tender_id: &str, doc_hash: &str) -> String {
    format!("{}/work/{doc_hash}", tender_prefix(org_id, tender_id))
}

pub fn pages_key(org_id: &str, tender_id: &str, doc_hash: &str) -> String {
    format!("{}/{PAGES_FILE_NAME}", work_prefix(org_id, tender_id, doc_hash))
}

pub fn chunks_key(org_id: &str, tender_id: &str, doc_hash: &str) -> String {
    format!("{}/{CHUNKS_FILE_NAME}", work_prefix(org_id, tender_id, doc_hash))
}

pub fn partial_embeddings_key(org_id: &str, tender_id: &str, doc_hash: &str) -> String {
    format!(
        "{}/{PARTIAL_EMBEDDINGS_FILE_NAME}",
        work_prefix(org_id, tender_id, doc_hash)
    )
}

pub fn summary_key(org_id: &str, tender_id: &str, doc_hash: &str) -> String {
    format!("{}/{SUMMARY_FILE_NAME}", work_prefix(org_id, tender_id, doc_hash))
}

pub fn artifact_key(org_id: &str, tender_id: &str, doc_hash: &str, version: u32) -> String {
    format!(
        "{}/indexes/{doc_hash}/v{version}/{ARTIFACT_FILE_NAME}",
        tender_prefix(org_id, tender_id)
    )
}

/// Lock key serialising one stage of one document record.
pub fn stage_lock_key(document_id: &str, stage: &str) -> String {
    format!("{document_id}:{stage}")
}

/// Lock key serialising usage-counter mutation for one organisation.
pub fn org_usage_lock_key(org_id: &str) -> String {
    format!("org-usage:{org_id}")
}

/// Keeps the last path segment and replaces characters that are unsafe in object keys.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
