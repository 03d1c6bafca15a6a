use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Which read path answers queries.
///
/// `Artifact` serves packaged index snapshots. `Incremental` reads per-chunk rows from the
/// database and is kept only for deployments that have not migrated yet.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexPath {
    #[default]
    Artifact,
    Incremental,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_bucket")]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default = "default_blob_max_object_bytes")]
    pub blob_max_object_bytes: usize,
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_partial_ready_ratio")]
    pub partial_ready_ratio: f64,
    #[serde(default = "default_max_archive_entries")]
    pub max_archive_entries: usize,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_artifact_cache_entries")]
    pub artifact_cache_entries: u64,
    #[serde(default = "default_artifact_cache_bytes")]
    pub artifact_cache_bytes: u64,
    #[serde(default)]
    pub index_path: IndexPath,
    #[serde(default = "default_trial_brief_credits")]
    pub trial_brief_credits: u32,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_bucket() -> String {
    "tenders".to_string()
}

fn default_blob_max_object_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_top_k() -> usize {
    8
}

fn default_embedding_batch_size() -> usize {
    64
}

fn default_partial_ready_ratio() -> f64 {
    0.5
}

fn default_max_archive_entries() -> usize {
    500
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    1200
}

fn default_chunk_overlap() -> usize {
    180
}

fn default_context_char_budget() -> usize {
    8000
}

fn default_lock_ttl_secs() -> u64 {
    120
}

fn default_progress_ttl_secs() -> u64 {
    3600
}

fn default_artifact_cache_entries() -> u64 {
    32
}

fn default_artifact_cache_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_trial_brief_credits() -> u32 {
    3
}

impl AppConfig {
    /// Batch size clamped to what the embedding providers accept.
    pub fn effective_batch_size(&self) -> usize {
        self.embedding_batch_size.clamp(1, 512)
    }

    /// Partial-ready ratio clamped into `[0, 1]`.
    pub fn effective_partial_ready_ratio(&self) -> f64 {
        if self.partial_ready_ratio.is_nan() {
            return default_partial_ready_ratio();
        }
        self.partial_ready_ratio.clamp(0.0, 1.0)
    }

    pub fn has_openai_key(&self) -> bool {
        self.openai_api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "tenders".to_string(),
            surrealdb_database: "tenders".to_string(),
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            storage: default_storage_kind(),
            s3_bucket: default_bucket(),
            s3_region: None,
            s3_endpoint: None,
            blob_max_object_bytes: default_blob_max_object_bytes(),
            retrieval_top_k: default_top_k(),
            embedding_batch_size: default_embedding_batch_size(),
            partial_ready_ratio: default_partial_ready_ratio(),
            max_archive_entries: default_max_archive_entries(),
            max_upload_bytes: default_max_upload_bytes(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            context_char_budget: default_context_char_budget(),
            lock_ttl_secs: default_lock_ttl_secs(),
            progress_ttl_secs: default_progress_ttl_secs(),
            artifact_cache_entries: default_artifact_cache_entries(),
            artifact_cache_bytes: default_artifact_cache_bytes(),
            index_path: IndexPath::default(),
            trial_brief_credits: default_trial_brief_credits(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.retrieval_top_k, 8);
        assert_eq!(config.embedding_batch_size, 64);
        assert_eq!(config.max_archive_entries, 500);
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.chunk_size, 1200);
        assert_eq!(config.chunk_overlap, 180);
        assert_eq!(config.context_char_budget, 8000);
        assert_eq!(config.index_path, IndexPath::Artifact);
        assert!(!config.has_openai_key());
    }

    #[test]
    fn batch_size_and_ratio_are_clamped() {
        let config = AppConfig {
            embedding_batch_size: 10_000,
            partial_ready_ratio: 4.0,
            ..Default::default()
        };
        assert_eq!(config.effective_batch_size(), 512);
        assert!((config.effective_partial_ready_ratio() - 1.0).abs() < f64::EPSILON);

        let zero = AppConfig {
            embedding_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(zero.effective_batch_size(), 1);
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = AppConfig {
            openai_api_key: Some("   ".into()),
            ..Default::default()
        };
        assert!(!config.has_openai_key());
    }
}
