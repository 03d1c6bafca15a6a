use std::{cmp::Ordering, collections::HashSet};

use common::{
    artifact::LoadedArtifact, error::AppError, storage::types::text_chunk::TextChunk,
};
use serde::Serialize;

/// Hard ceiling on passages returned by one search.
pub const MAX_TOP_K: usize = 24;

/// A chunk matched by a query, with everything the answer composer needs to cite it.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub document_id: String,
    pub title: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub page_start: u32,
    pub page_end: u32,
    pub heading: Option<String>,
    pub text: String,
    pub score: f32,
}

pub fn clamp_top_k(top_k: usize) -> usize {
    top_k.clamp(1, MAX_TOP_K)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Nearest-neighbour lookup over a row-major vector matrix.
///
/// Results are `(row, score)` pairs ordered by score descending; equal scores keep row order.
pub trait VectorIndex: Send + Sync {
    fn nearest(&self, query: &[f32], limit: usize) -> Vec<(usize, f32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact search that scores every row.
pub struct BruteForceIndex<'a> {
    vectors: &'a [f32],
    dimension: usize,
}

impl<'a> BruteForceIndex<'a> {
    pub fn new(vectors: &'a [f32], dimension: usize) -> Self {
        Self { vectors, dimension }
    }
}

impl VectorIndex for BruteForceIndex<'_> {
    fn nearest(&self, query: &[f32], limit: usize) -> Vec<(usize, f32)> {
        if self.dimension == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| cosine_similarity(query, row))
            .enumerate()
            .collect();
        scored.sort_by(rank_order);
        scored.truncate(limit);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len().checked_div(self.dimension).unwrap_or(0)
    }
}

fn rank_order(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Top passages of a loaded artifact for an already embedded query.
pub fn search_artifact(
    artifact: &LoadedArtifact,
    query: &[f32],
    top_k: usize,
) -> Result<Vec<ScoredPassage>, AppError> {
    let dimension = artifact.dimension();
    if query.len() != dimension {
        return Err(AppError::Consistency(format!(
            "query embedding has {} dimensions but the index was built with {dimension} ({})",
            query.len(),
            artifact.model()
        )));
    }

    let index = BruteForceIndex::new(&artifact.vectors, dimension);
    let mut passages: Vec<ScoredPassage> = index
        .nearest(query, index.len())
        .into_iter()
        .filter_map(|(row, score)| {
            let chunk = artifact.chunks.get(row)?;
            let title = artifact
                .names
                .get(&chunk.file_id)
                .map_or_else(|| chunk.file_id.clone(), |entry| entry.name.clone());
            Some(ScoredPassage {
                document_id: chunk.file_id.clone(),
                title,
                chunk_id: chunk.id.clone(),
                chunk_index: chunk.chunk_index,
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                heading: chunk.heading.clone(),
                text: chunk.text.clone(),
                score,
            })
        })
        .collect();

    sort_passages(&mut passages);
    passages.truncate(clamp_top_k(top_k));
    Ok(passages)
}

/// Search over stored chunk rows. Only the best chunk per (document, start page) is kept.
pub fn search_chunk_rows(
    rows: &[TextChunk],
    title: &str,
    query: &[f32],
    top_k: usize,
) -> Vec<ScoredPassage> {
    let mut passages: Vec<ScoredPassage> = rows
        .iter()
        .filter(|row| row.embedding.len() == query.len())
        .map(|row| ScoredPassage {
            document_id: row.document_id.clone(),
            title: title.to_string(),
            chunk_id: row.id.clone(),
            chunk_index: row.chunk_index,
            page_start: row.page_start,
            page_end: row.page_end,
            heading: row.heading.clone(),
            text: row.text.clone(),
            score: cosine_similarity(query, &row.embedding),
        })
        .collect();
    sort_passages(&mut passages);

    let mut seen = HashSet::new();
    passages.retain(|passage| seen.insert((passage.document_id.clone(), passage.page_start)));
    passages.truncate(clamp_top_k(top_k));
    passages
}

/// Score descending, then chunk order. Passages from several documents stay deterministic
/// through the document id.
pub fn sort_passages(passages: &mut [ScoredPassage]) {
    passages.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        artifact::{self, ArtifactInput, ChunkRecord, NameEntry, NamesMap},
        utils::embedding::{hashed_embedding, FALLBACK_DIMENSION, FALLBACK_MODEL},
    };

    fn record(index: u32, page: u32, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: format!("doc-1:{index}"),
            file_id: "doc-1".into(),
            chunk_index: index,
            page_start: page,
            page_end: page,
            heading: None,
            text: text.into(),
            token_estimate: 2,
        }
    }

    fn loaded(texts: &[&str]) -> LoadedArtifact {
        let chunks: Vec<ChunkRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let index = u32::try_from(i).expect("index");
                record(index, index + 1, text)
            })
            .collect();
        let embeddings = texts
            .iter()
            .map(|text| hashed_embedding(text, FALLBACK_DIMENSION))
            .collect();
        let mut names = NamesMap::new();
        names.insert(
            "doc-1".into(),
            NameEntry {
                path: "raw/doc-1.txt".into(),
                name: "Volume 1".into(),
                page_count: u32::try_from(texts.len()).expect("pages"),
            },
        );
        let input = ArtifactInput {
            doc_hash: "hash-1".into(),
            chunks,
            embeddings,
            pages: u32::try_from(texts.len()).expect("pages"),
            chunk_size: 20,
            chunk_overlap: 5,
            model: FALLBACK_MODEL.into(),
            dimension: u32::try_from(FALLBACK_DIMENSION).expect("dimension"),
            names,
        };
        let (bytes, _) = artifact::build(&input).expect("build");
        artifact::load(&bytes).expect("load")
    }

    #[test]
    fn best_match_comes_first_with_its_title() {
        let artifact = loaded(&["Alpha Beta", "Gamma Delta", "Payment terms net thirty"]);
        let query = hashed_embedding("Gamma Delta", FALLBACK_DIMENSION);

        let hits = search_artifact(&artifact, &query, 3).expect("search");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].text, "Gamma Delta");
        assert_eq!(hits[0].page_start, 2);
        assert_eq!(hits[0].title, "Volume 1");
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn smaller_k_is_a_prefix_of_larger_k() {
        let artifact = loaded(&[
            "site visit schedule",
            "site visit mandatory",
            "bid bond amount",
            "insurance requirements",
            "site office",
        ]);
        let query = hashed_embedding("site visit", FALLBACK_DIMENSION);

        let wide = search_artifact(&artifact, &query, 5).expect("wide");
        let narrow = search_artifact(&artifact, &query, 2).expect("narrow");
        let again = search_artifact(&artifact, &query, 5).expect("again");

        let ids = |hits: &[ScoredPassage]| {
            hits.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&narrow), ids(&wide)[..2].to_vec());
        assert_eq!(ids(&wide), ids(&again));
    }

    #[test]
    fn top_k_is_clamped() {
        assert_eq!(clamp_top_k(0), 1);
        assert_eq!(clamp_top_k(8), 8);
        assert_eq!(clamp_top_k(500), MAX_TOP_K);
    }

    #[test]
    fn equal_scores_keep_chunk_order() {
        let vectors = [1.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        let index = BruteForceIndex::new(&vectors, 2);
        let hits = index.nearest(&[1.0, 0.0], 3);
        let rows: Vec<usize> = hits.iter().map(|(row, _)| *row).collect();
        assert_eq!(rows, vec![0, 1, 2]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn mismatched_query_dimension_is_rejected() {
        let artifact = loaded(&["Alpha Beta"]);
        let result = search_artifact(&artifact, &[1.0, 0.0], 1);
        assert!(matches!(result, Err(AppError::Consistency(_))));
    }

    #[test]
    fn zero_vectors_score_zero() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).abs() < f32::EPSILON);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).abs() < f32::EPSILON);
    }

    #[test]
    fn row_search_keeps_best_chunk_per_page() {
        let row = |index: u32, page: u32, text: &str| {
            TextChunk::new(
                "doc-1".into(),
                "org".into(),
                "tender".into(),
                index,
                page,
                page,
                None,
                text.into(),
                hashed_embedding(text, FALLBACK_DIMENSION),
            )
        };
        let rows = vec![
            row(0, 1, "liquidated damages apply"),
            row(1, 1, "liquidated damages cap"),
            row(2, 2, "scope of works"),
        ];
        let query = hashed_embedding("liquidated damages", FALLBACK_DIMENSION);

        let hits = search_chunk_rows(&rows, "Conditions", &query, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].page_start, 1);
        assert_eq!(hits[1].page_start, 2);
        assert_eq!(hits[0].title, "Conditions");
    }
}
