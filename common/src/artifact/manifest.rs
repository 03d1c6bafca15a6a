use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

use super::codec::sha256_hex;

pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHUNKS_FILE: &str = "chunks.jsonl.gz";
pub const EMBEDDINGS_FILE: &str = "embeddings.f16.bin";
pub const NAMES_FILE: &str = "names.map.json";
pub const HNSW_FILE: &str = "hnsw.index";

/// One line of `chunks.jsonl.gz`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: String,
    pub file_id: String,
    pub chunk_index: u32,
    pub page_start: u32,
    pub page_end: u32,
    #[serde(default)]
    pub heading: Option<String>,
    pub text: String,
    pub token_estimate: u32,
}

impl ChunkRecord {
    /// Rough token count, four characters per token.
    pub fn estimate_tokens(text: &str) -> u32 {
        let chars = text.chars().count();
        u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NameEntry {
    pub path: String,
    pub name: String,
    pub page_count: u32,
}

pub type NamesMap = BTreeMap<String, NameEntry>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestStats {
    pub total_chunks: u32,
    pub pages: u32,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestParams {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub embedding_model: String,
    pub embedding_dimension: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

impl ManifestFile {
    pub fn describe(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes: data.len() as u64,
            sha256: sha256_hex(data),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub doc_hash: String,
    pub format_version: u32,
    pub stats: ManifestStats,
    pub params: ManifestParams,
    pub files: Vec<ManifestFile>,
    pub checksum: String,
}

impl Manifest {
    pub fn new(
        doc_hash: String,
        stats: ManifestStats,
        params: ManifestParams,
        files: Vec<ManifestFile>,
    ) -> Result<Self, AppError> {
        let checksum = Self::compute_checksum(&stats, &params, &files)?;
        Ok(Self {
            doc_hash,
            format_version: FORMAT_VERSION,
            stats,
            params,
            files,
            checksum,
        })
    }

    /// SHA-256 of the canonical JSON of stats, params and the file list.
    ///
    /// `serde_json::Value` objects keep keys sorted, which makes the encoding canonical.
    pub fn compute_checksum(
        stats: &ManifestStats,
        params: &ManifestParams,
        files: &[ManifestFile],
    ) -> Result<String, AppError> {
        let canonical = serde_json::to_value(serde_json::json!({
            "stats": stats,
            "params": params,
            "files": files,
        }))?;
        Ok(sha256_hex(&serde_json::to_vec(&canonical)?))
    }

    pub fn verify_checksum(&self) -> Result<(), AppError> {
        let expected = Self::compute_checksum(&self.stats, &self.params, &self.files)?;
        if expected != self.checksum {
            return Err(AppError::Consistency(format!(
                "manifest checksum mismatch for {}",
                self.doc_hash
            )));
        }
        Ok(())
    }

    pub fn file(&self, name: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::new(
            "h".into(),
            ManifestStats {
                total_chunks: 2,
                pages: 1,
                tokens: 10,
            },
            ManifestParams {
                chunk_size: 1200,
                chunk_overlap: 180,
                embedding_model: "hashed-fallback-v1".into(),
                embedding_dimension: 256,
            },
            vec![ManifestFile::describe(CHUNKS_FILE, b"abc")],
        )
        .expect("manifest")
    }

    #[test]
    fn checksum_covers_file_digests() {
        let original = manifest();
        original.verify_checksum().expect("valid");

        let mut tampered = original.clone();
        tampered.files[0].sha256 = "0".repeat(64);
        assert!(matches!(
            tampered.verify_checksum(),
            Err(AppError::Consistency(_))
        ));
    }

    #[test]
    fn checksum_covers_params() {
        let mut tampered = manifest();
        tampered.params.embedding_dimension = 1536;
        assert!(tampered.verify_checksum().is_err());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(ChunkRecord::estimate_tokens(""), 0);
        assert_eq!(ChunkRecord::estimate_tokens("abcde"), 2);
    }
}
