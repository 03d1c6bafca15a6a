//! One handler per pipeline stage. Each returns the payloads to enqueue once it has committed
//! its output; re-running a handler whose output already exists only re-emits its successor.

pub mod chunk;
pub mod embed;
pub mod extract;
pub mod manifest;
pub mod summary;

use common::storage::types::{
    document::Document,
    job_payload::{priority_score, DocumentJob, StorageDescriptor},
};

/// Job fields for a stored document.
pub fn document_job(document: &Document, bucket: &str) -> DocumentJob {
    DocumentJob {
        org_id: document.org_id.clone(),
        tender_id: document.tender_id.clone(),
        document_id: document.id.clone(),
        doc_hash: document.doc_hash.clone(),
        storage: StorageDescriptor::for_document(
            bucket,
            &document.org_id,
            &document.tender_id,
            &document.doc_hash,
            document.raw_key.clone(),
        ),
        upload_id: document.upload_id.clone(),
        filename: document.title.clone(),
        priority: priority_score(document.byte_size, &document.title),
    }
}
