use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::utils::config::AppConfig;

/// Dimension of the deterministic offline embedding.
pub const FALLBACK_DIMENSION: usize = 256;
/// Model label recorded on documents embedded with the offline function.
pub const FALLBACK_MODEL: &str = "hashed-fallback-v1";
const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAI,
    Hashed,
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Builds the provider the configuration asks for. Without an API key the offline
    /// function is the only option.
    pub fn from_config(
        config: &AppConfig,
        client: Option<Arc<Client<async_openai::config::OpenAIConfig>>>,
    ) -> Self {
        match client {
            Some(client) if config.has_openai_key() => Self::new_openai(
                client,
                config.embedding_model.clone(),
                config.embedding_dimensions,
            ),
            _ => Self::fallback(),
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }

    pub fn fallback() -> Self {
        Self::new_hashed(FALLBACK_DIMENSION)
    }

    pub fn backend(&self) -> EmbeddingBackend {
        match self.inner {
            EmbeddingInner::OpenAI { .. } => EmbeddingBackend::OpenAI,
            EmbeddingInner::Hashed { .. } => EmbeddingBackend::Hashed,
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> String {
        match &self.inner {
            EmbeddingInner::OpenAI { model, .. } => model.clone(),
            EmbeddingInner::Hashed { .. } => FALLBACK_MODEL.to_string(),
        }
    }

    /// Provider able to embed queries against vectors produced by `model`.
    pub fn for_model(&self, model: &str) -> Self {
        if model == FALLBACK_MODEL {
            Self::fallback()
        } else {
            self.clone()
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("No embedding data received from provider"))
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                if texts.is_empty() {
                    return Ok(Vec::new());
                }
                let expected = texts.len();

                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let mut data = response.data;
                data.sort_by_key(|item| item.index);
                let embeddings: Vec<Vec<f32>> =
                    data.into_iter().map(|item| item.embedding).collect();

                if embeddings.len() != expected {
                    return Err(anyhow!(
                        "Provider returned {} embeddings for {expected} inputs",
                        embeddings.len()
                    ));
                }
                debug!(count = expected, model = %model, "embedded batch");

                Ok(embeddings)
            }
        }
    }
}

/// Network-class failures that switch a document to the offline embedding.
pub fn is_transient_provider_error(err: &anyhow::Error) -> bool {
    const MARKERS: [&str; 8] = [
        "connection reset",
        "connection refused",
        "connection closed",
        "dns error",
        "failed to lookup address",
        "timed out",
        "timeout",
        "error sending request",
    ];

    err.chain().any(|cause| {
        let message = cause.to_string().to_lowercase();
        MARKERS.iter().any(|marker| message.contains(marker))
    })
}

/// Deterministic bag-of-ngrams embedding.
///
/// Every lowercase alphanumeric token and every adjacent token pair is hashed with SHA-256.
/// The first four digest bytes (little endian) select the index and the low bit of the fifth
/// byte selects the sign. Bigrams contribute half weight. The result is L2-normalised.
pub fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    let tokens: Vec<String> = tokens(text).collect();
    if tokens.is_empty() {
        return vector;
    }

    for token in &tokens {
        accumulate(&mut vector, token, 1.0);
    }
    for pair in tokens.windows(2) {
        if let [left, right] = pair {
            accumulate(&mut vector, &format!("{left} {right}"), BIGRAM_WEIGHT);
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn accumulate(vector: &mut [f32], feature: &str, weight: f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let index_bytes = [digest[0], digest[1], digest[2], digest[3]];
    let index = u32::from_le_bytes(index_bytes) as usize % vector.len();
    let sign = if digest[4] & 1 == 1 { -1.0 } else { 1.0 };
    if let Some(slot) = vector.get_mut(index) {
        *slot += sign * weight;
    }
}
