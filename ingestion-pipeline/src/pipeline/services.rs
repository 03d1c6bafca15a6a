use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{embedding::EmbeddingProvider, llm::LanguageModel},
};
use tracing::warn;

use crate::utils::{
    llm_instructions::{
        extractive_summary, summary_user_message, DOCUMENT_SUMMARY_SYSTEM_MESSAGE,
        EXTRACTIVE_SUMMARY_CHARS, SUMMARY_INPUT_CHAR_LIMIT,
    },
    text_extraction::{extract_pages, ExtractedPage},
};

/// Outbound collaborators of the pipeline stages.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn extract_pages(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: &str,
    ) -> Result<Vec<ExtractedPage>, AppError>;

    /// Model code recorded next to vectors produced by [`PipelineServices::embed_batch`].
    fn embedding_model(&self) -> String;

    fn embedding_dimension(&self) -> usize;

    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn summarize(&self, title: &str, text: &str) -> Result<String, AppError>;
}

pub struct DefaultPipelineServices {
    embedding_provider: Arc<EmbeddingProvider>,
    language_model: Option<Arc<dyn LanguageModel>>,
}

impl DefaultPipelineServices {
    pub fn new(
        embedding_provider: Arc<EmbeddingProvider>,
        language_model: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            embedding_provider,
            language_model,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn extract_pages(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: &str,
    ) -> Result<Vec<ExtractedPage>, AppError> {
        let mime_type = mime_type.to_string();
        let file_name = file_name.to_string();
        tokio::task::spawn_blocking(move || extract_pages(&bytes, &mime_type, &file_name)).await?
    }

    fn embedding_model(&self) -> String {
        self.embedding_provider.model_code()
    }

    fn embedding_dimension(&self) -> usize {
        self.embedding_provider.dimension()
    }

    async fn embed_batch(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        self.embedding_provider.embed_batch(texts).await
    }

    async fn summarize(&self, title: &str, text: &str) -> Result<String, AppError> {
        let Some(model) = &self.language_model else {
            return Ok(extractive_summary(text, EXTRACTIVE_SUMMARY_CHARS));
        };

        let excerpt: String = text.chars().take(SUMMARY_INPUT_CHAR_LIMIT).collect();
        match model
            .complete(
                DOCUMENT_SUMMARY_SYSTEM_MESSAGE,
                &summary_user_message(title, &excerpt),
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => Ok(summary.trim().to_string()),
            Ok(_) => Ok(extractive_summary(text, EXTRACTIVE_SUMMARY_CHARS)),
            Err(err) => {
                warn!(title, error = %err, "summary model failed; using extractive summary");
                Ok(extractive_summary(text, EXTRACTIVE_SUMMARY_CHARS))
            }
        }
    }
}
