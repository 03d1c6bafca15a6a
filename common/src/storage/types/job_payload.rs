use serde::{Deserialize, Serialize};

use crate::storage::keys;

/// Pipeline stage a job belongs to. Each stage has its own worker pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    Manifest,
    Extract,
    Chunk,
    Embed,
    Summary,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Manifest,
        Stage::Extract,
        Stage::Chunk,
        Stage::Embed,
        Stage::Summary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Manifest => "Manifest",
            Stage::Extract => "Extract",
            Stage::Chunk => "Chunk",
            Stage::Embed => "Embed",
            Stage::Summary => "Summary",
        }
    }

    pub fn lock_name(self) -> &'static str {
        match self {
            Stage::Manifest => "manifest",
            Stage::Extract => "extract",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Summary => "summary",
        }
    }
}

/// Where a document's inputs and stage outputs live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub bucket: String,
    pub raw_key: String,
    pub extracted_key: String,
    pub chunks_key: String,
    pub summary_key: String,
}

impl StorageDescriptor {
    pub fn for_document(
        bucket: &str,
        org_id: &str,
        tender_id: &str,
        doc_hash: &str,
        raw_key: String,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            raw_key,
            extracted_key: keys::pages_key(org_id, tender_id, doc_hash),
            chunks_key: keys::chunks_key(org_id, tender_id, doc_hash),
            summary_key: keys::summary_key(org_id, tender_id, doc_hash),
        }
    }
}

/// Fields every document-level stage job carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentJob {
    pub org_id: String,
    pub tender_id: String,
    pub document_id: String,
    pub doc_hash: String,
    pub storage: StorageDescriptor,
    pub upload_id: String,
    pub filename: String,
    pub priority: i32,
}

/// Upload-level discovery job. Documents do not exist yet when it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestJob {
    pub org_id: String,
    pub tender_id: String,
    pub upload_id: String,
    pub filename: String,
    pub bucket: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkJob {
    pub document: DocumentJob,
    pub extracted_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbedJob {
    pub document: DocumentJob,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryJob {
    pub document: DocumentJob,
    pub section_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobPayload {
    Manifest(ManifestJob),
    Extract(DocumentJob),
    Chunk(ChunkJob),
    Embed(EmbedJob),
    Summary(SummaryJob),
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::Manifest(_) => Stage::Manifest,
            JobPayload::Extract(_) => Stage::Extract,
            JobPayload::Chunk(_) => Stage::Chunk,
            JobPayload::Embed(_) => Stage::Embed,
            JobPayload::Summary(_) => Stage::Summary,
        }
    }

    /// Document-level fields, absent for manifest jobs.
    pub fn document(&self) -> Option<&DocumentJob> {
        match self {
            JobPayload::Manifest(_) => None,
            JobPayload::Extract(job) => Some(job),
            JobPayload::Chunk(job) => Some(&job.document),
            JobPayload::Embed(job) => Some(&job.document),
            JobPayload::Summary(job) => Some(&job.document),
        }
    }

    pub fn priority(&self) -> i32 {
        self.document().map_or(0, |job| job.priority)
    }
}

/// Scores a document so that small files and earlier names run first. Higher runs sooner.
pub fn priority_score(byte_size: u64, file_name: &str) -> i32 {
    let size_kib = byte_size / 1024;
    // log2 buckets keep the score bounded for very large files
    let size_bucket = i32::try_from(64_u32.saturating_sub(size_kib.leading_zeros())).unwrap_or(64);
    let name_rank = file_name
        .chars()
        .next()
        .map_or(0, |c| i32::try_from(u32::from(c.to_ascii_lowercase()).min(127)).unwrap_or(127));

    1_000_i32
        .saturating_sub(size_bucket.saturating_mul(10))
        .saturating_sub(name_rank / 13)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document_job() -> DocumentJob {
        DocumentJob {
            org_id: "o".into(),
            tender_id: "t".into(),
            document_id: "d".into(),
            doc_hash: "h".into(),
            storage: StorageDescriptor::for_document("b", "o", "t", "h", "raw".into()),
            upload_id: "u".into(),
            filename: "a.pdf".into(),
            priority: 7,
        }
    }

    #[test]
    fn payload_serializes_as_stage_variant() {
        let payload = JobPayload::Embed(EmbedJob {
            document: document_job(),
            chunk_count: 12,
        });
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["Embed"]["chunk_count"], 12);
        assert_eq!(json["Embed"]["document"]["doc_hash"], "h");

        let back: JobPayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.stage(), Stage::Embed);
        assert_eq!(back.priority(), 7);
    }

    #[test]
    fn smaller_files_get_higher_priority() {
        let small = priority_score(10 * 1024, "b.pdf");
        let large = priority_score(40 * 1024 * 1024, "b.pdf");
        assert!(small > large);

        let early = priority_score(10 * 1024, "a.pdf");
        let late = priority_score(10 * 1024, "z.pdf");
        assert!(early >= late);
    }
}
