//! Versioned, immutable per-document index snapshots.
//!
//! An artifact is a gzip-compressed tarball holding the chunk stream, the binary16 embedding
//! matrix, a file-name map and a manifest that checksums all of it. Loading always verifies.

pub mod codec;
pub mod manifest;

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder, Header};

use crate::error::AppError;

pub use manifest::{
    ChunkRecord, Manifest, ManifestFile, ManifestParams, ManifestStats, NameEntry, NamesMap,
};
use manifest::{CHUNKS_FILE, EMBEDDINGS_FILE, MANIFEST_FILE, NAMES_FILE};

/// Everything needed to package one document.
#[derive(Debug, Clone)]
pub struct ArtifactInput {
    pub doc_hash: String,
    pub chunks: Vec<ChunkRecord>,
    pub embeddings: Vec<Vec<f32>>,
    pub pages: u32,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub model: String,
    pub dimension: u32,
    pub names: NamesMap,
}

/// A verified artifact with its vectors decoded to f32, row-major.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub manifest: Manifest,
    pub chunks: Vec<ChunkRecord>,
    pub vectors: Vec<f32>,
    pub names: NamesMap,
}

impl LoadedArtifact {
    pub fn dimension(&self) -> usize {
        self.manifest.params.embedding_dimension as usize
    }

    pub fn model(&self) -> &str {
        &self.manifest.params.embedding_model
    }

    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let dim = self.dimension();
        let start = row.checked_mul(dim)?;
        self.vectors.get(start..start.checked_add(dim)?)
    }

    /// Approximate resident size, used to weigh cache entries.
    pub fn byte_size(&self) -> usize {
        let text: usize = self
            .chunks
            .iter()
            .map(|c| c.text.len().saturating_add(c.id.len()).saturating_add(64))
            .sum();
        self.vectors
            .len()
            .saturating_mul(std::mem::size_of::<f32>())
            .saturating_add(text)
    }
}

/// Packages `input` into tar.gz bytes and returns them with the manifest written inside.
pub fn build(input: &ArtifactInput) -> Result<(Vec<u8>, Manifest), AppError> {
    if input.embeddings.len() != input.chunks.len() {
        return Err(AppError::Consistency(format!(
            "{} chunks but {} embeddings for {}",
            input.chunks.len(),
            input.embeddings.len(),
            input.doc_hash
        )));
    }

    let dim = input.dimension as usize;
    let mut flat = Vec::with_capacity(input.embeddings.len().saturating_mul(dim));
    for (index, vector) in input.embeddings.iter().enumerate() {
        if vector.len() != dim {
            return Err(AppError::Consistency(format!(
                "embedding {index} has dimension {} instead of {dim}",
                vector.len()
            )));
        }
        flat.extend_from_slice(vector);
    }

    let chunks_bytes = codec::gzip_jsonl(&input.chunks)?;
    let embeddings_bytes = codec::encode_f16(&flat);
    let names_bytes = serde_json::to_vec(&input.names)?;

    let stats = ManifestStats {
        total_chunks: u32::try_from(input.chunks.len()).unwrap_or(u32::MAX),
        pages: input.pages,
        tokens: input
            .chunks
            .iter()
            .map(|c| u64::from(c.token_estimate))
            .sum(),
    };
    let params = ManifestParams {
        chunk_size: input.chunk_size,
        chunk_overlap: input.chunk_overlap,
        embedding_model: input.model.clone(),
        embedding_dimension: input.dimension,
    };
    let files = vec![
        ManifestFile::describe(CHUNKS_FILE, &chunks_bytes),
        ManifestFile::describe(EMBEDDINGS_FILE, &embeddings_bytes),
        ManifestFile::describe(NAMES_FILE, &names_bytes),
    ];
    let manifest = Manifest::new(input.doc_hash.clone(), stats, params, files)?;
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (name, data) in [
        (MANIFEST_FILE, manifest_bytes.as_slice()),
        (CHUNKS_FILE, chunks_bytes.as_slice()),
        (EMBEDDINGS_FILE, embeddings_bytes.as_slice()),
        (NAMES_FILE, names_bytes.as_slice()),
    ] {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, data)?;
    }
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    let bytes = encoder.finish()?;

    Ok((bytes, manifest))
}

/// Unpacks and verifies an artifact. Any mismatch is a consistency error.
pub fn load(bytes: &[u8]) -> Result<LoadedArtifact, AppError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }

    let manifest_bytes = files
        .get(MANIFEST_FILE)
        .ok_or_else(|| AppError::Consistency("artifact has no manifest".into()))?;
    let manifest: Manifest = serde_json::from_slice(manifest_bytes)?;
    manifest.verify_checksum()?;

    for listed in &manifest.files {
        let data = files.get(&listed.name).ok_or_else(|| {
            AppError::Consistency(format!("artifact is missing {}", listed.name))
        })?;
        if data.len() as u64 != listed.bytes || codec::sha256_hex(data) != listed.sha256 {
            return Err(AppError::Consistency(format!(
                "digest mismatch for {} in {}",
                listed.name, manifest.doc_hash
            )));
        }
    }

    let required = |name: &str| {
        if manifest.file(name).is_none() {
            return Err(AppError::Consistency(format!("manifest does not list {name}")));
        }
        files
            .get(name)
            .ok_or_else(|| AppError::Consistency(format!("artifact is missing {name}")))
    };

    let chunks: Vec<ChunkRecord> = codec::gunzip_jsonl(required(CHUNKS_FILE)?)?;
    let vectors = codec::decode_f16(required(EMBEDDINGS_FILE)?)?;
    let names: NamesMap = serde_json::from_slice(required(NAMES_FILE)?)?;

    let expected_chunks = manifest.stats.total_chunks as usize;
    let dim = manifest.params.embedding_dimension as usize;
    if chunks.len() != expected_chunks || vectors.len() != expected_chunks.saturating_mul(dim) {
        return Err(AppError::Consistency(format!(
            "artifact {} holds {} chunks and {} values, manifest promises {} x {}",
            manifest.doc_hash,
            chunks.len(),
            vectors.len(),
            expected_chunks,
            dim
        )));
    }

    Ok(LoadedArtifact {
        manifest,
        chunks,
        vectors,
        names,
    })
}
