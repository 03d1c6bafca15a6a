use std::time::Duration;

use common::{
    storage::types::job_payload::Stage,
    utils::config::{AppConfig, IndexPath},
};

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
    pub manifest_workers: usize,
    pub extract_workers: usize,
    pub chunk_workers: usize,
    pub embed_workers: usize,
    pub summary_workers: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_batch_size: usize,
    pub max_archive_entries: usize,
    pub partial_ready_ratio: f64,
    pub lock_ttl_secs: u64,
    /// Wait before re-running a job whose stage lock was held by another worker.
    pub lock_busy_delay_secs: u64,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 15 * 60,
            retry_backoff_cap_exponent: 5,
            manifest_workers: 1,
            extract_workers: 4,
            chunk_workers: 8,
            embed_workers: 16,
            summary_workers: 4,
            chunk_size: 1_200,
            chunk_overlap: 180,
            embedding_batch_size: 64,
            max_archive_entries: 500,
            partial_ready_ratio: 0.5,
            lock_ttl_secs: 120,
            lock_busy_delay_secs: 15,
        }
    }
}

impl IngestionTuning {
    pub fn workers_for(&self, stage: Stage) -> usize {
        let count = match stage {
            Stage::Manifest => self.manifest_workers,
            Stage::Extract => self.extract_workers,
            Stage::Chunk => self.chunk_workers,
            Stage::Embed => self.embed_workers,
            Stage::Summary => self.summary_workers,
        };
        count.max(1)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn lock_busy_delay(&self) -> Duration {
        Duration::from_secs(self.lock_busy_delay_secs)
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    pub index_path: IndexPath,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            tuning: IngestionTuning::default(),
            index_path: IndexPath::Artifact,
        }
    }
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning {
                chunk_size: config.chunk_size.max(1),
                chunk_overlap: config.chunk_overlap,
                embedding_batch_size: config.effective_batch_size(),
                max_archive_entries: config.max_archive_entries,
                partial_ready_ratio: config.effective_partial_ready_ratio(),
                lock_ttl_secs: config.lock_ttl_secs,
                ..IngestionTuning::default()
            },
            index_path: config.index_path,
        }
    }
}
