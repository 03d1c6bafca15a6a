use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Consistency error: {0}")]
    Consistency(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Usage limit reached: {message}")]
    UsageLimit { code: &'static str, message: String },
    #[error("Index not ready for document {0}")]
    IndexNotReady(String),
    #[error("Index build failed for document {0}")]
    IndexFailed(String),
    #[error("No groundable content: {0}")]
    NoGrounding(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the job queue should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_) | AppError::UnsupportedFormat(_) | AppError::Consistency(_)
        )
    }

    /// Short machine-readable code recorded on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::ObjectStore(_) => "object_store",
            AppError::OpenAI(_) => "provider",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::Consistency(_) => "consistency",
            AppError::Auth(_) => "auth",
            AppError::UsageLimit { code, .. } => code,
            AppError::IndexNotReady(_) => "index_not_ready",
            AppError::IndexFailed(_) => "index_failed",
            AppError::NoGrounding(_) => "no_grounding",
            AppError::LLMParsing(_) => "llm_parsing",
            AppError::Join(_) => "join",
            AppError::Io(_) => "io",
            AppError::Json(_) => "serialization",
            AppError::Anyhow(_) => "internal",
            AppError::Processing(_) => "processing",
            AppError::InternalError(_) => "internal",
        }
    }
}

/// Cuts an error message down to the length persisted on documents and jobs.
pub fn truncate_error_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    message.chars().take(max_chars).collect()
}
