//! Indexer configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Tuning knobs for every pipeline component.
///
/// All fields have defaults, so a JSON config file only needs the values it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    // ── chain-tip tracker ──
    /// Headers fetched per backfill batch.
    pub header_batch: usize,
    /// Headers written per tip-advance batch.
    pub tip_batch: usize,
    /// Backfill stops below this height. `None` = walk to the first block.
    pub start_height: Option<u64>,
    /// Delay between chain-tip passes (milliseconds).
    pub chain_tip_interval_ms: u64,

    // ── block cache ──
    /// Directory holding one `{hash}.bin` file per downloaded block.
    pub block_cache_dir: PathBuf,
    /// Number of blocks kept downloaded ahead of processing.
    pub block_cache_size: usize,
    /// Parallel block downloads.
    pub download_concurrency: usize,
    /// Completed blocks above this count are recycled to `NoStart`.
    pub completed_recycle_threshold: u64,
    pub download_interval_ms: u64,

    // ── decomposer ──
    /// Soft ceiling on queued block transactions.
    pub tx_queue_max: usize,
    pub decompose_concurrency: usize,
    /// Blocks considered per selection query.
    pub decompose_select_limit: usize,
    pub decompose_interval_ms: u64,

    // ── indexer ──
    /// Flush the block batch once it holds more inputs than this.
    pub flush_input_threshold: usize,
    /// Rows per upsert chunk for a threshold flush.
    pub flush_chunk_large: usize,
    /// Rows per upsert chunk for a drain flush.
    pub flush_chunk_small: usize,
    /// Upsert chunks in flight per entity type.
    pub write_concurrency: usize,
    /// Rows per upsert chunk on the mempool path.
    pub mempool_chunk: usize,
    pub mempool_write_concurrency: usize,
    /// Idle delay of the block batch and mempool loops.
    pub tx_process_interval_ms: u64,
    /// TxIn cursor window covered by one spend-marking update.
    pub spend_window: i64,
    pub spend_interval_ms: u64,

    // ── reconciler ──
    pub sweep_page: usize,
    pub completeness_interval_ms: u64,
    /// Unconfirmed transactions older than this are dropped.
    pub mempool_retention_secs: i64,
    pub timeout_interval_ms: u64,
    pub mempool_sync_interval_ms: u64,
    pub mempool_fetch_concurrency: usize,
    pub double_check_batch: usize,
    pub double_check_interval_ms: u64,
    pub spend_repair_interval_ms: u64,
    pub progress_interval_ms: u64,

    // ── verifier ──
    pub verify_batch: usize,
    pub verify_concurrency: usize,
    pub verify_idle_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            header_batch: 100,
            tip_batch: 10,
            start_height: None,
            chain_tip_interval_ms: 5_000,

            block_cache_dir: PathBuf::from("./block_cache"),
            block_cache_size: 20,
            download_concurrency: 20,
            completed_recycle_threshold: 200,
            download_interval_ms: 1_000,

            tx_queue_max: 10_000,
            decompose_concurrency: 5,
            decompose_select_limit: 100,
            decompose_interval_ms: 1_000,

            flush_input_threshold: 1_000,
            flush_chunk_large: 1_000,
            flush_chunk_small: 300,
            write_concurrency: 5,
            mempool_chunk: 100,
            mempool_write_concurrency: 2,
            tx_process_interval_ms: 500,
            spend_window: 10_000,
            spend_interval_ms: 1_000,

            sweep_page: 200,
            completeness_interval_ms: 5_000,
            mempool_retention_secs: 14 * 24 * 3600,
            timeout_interval_ms: 10_000,
            mempool_sync_interval_ms: 20 * 60 * 1_000,
            mempool_fetch_concurrency: 5,
            double_check_batch: 5,
            double_check_interval_ms: 1_000,
            spend_repair_interval_ms: 20_000,
            progress_interval_ms: 10 * 60 * 1_000,

            verify_batch: 100,
            verify_concurrency: 10,
            verify_idle_ms: 3_000,
        }
    }
}

impl IndexerConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall a loop.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let positive = [
            ("header_batch", self.header_batch),
            ("tip_batch", self.tip_batch),
            ("download_concurrency", self.download_concurrency),
            ("tx_queue_max", self.tx_queue_max),
            ("decompose_concurrency", self.decompose_concurrency),
            ("flush_chunk_large", self.flush_chunk_large),
            ("flush_chunk_small", self.flush_chunk_small),
            ("write_concurrency", self.write_concurrency),
            ("mempool_chunk", self.mempool_chunk),
            ("sweep_page", self.sweep_page),
            ("verify_batch", self.verify_batch),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IndexerError::Config(format!("{name} must be positive")));
            }
        }
        if self.tip_batch < 2 {
            return Err(IndexerError::Config("tip_batch must be at least 2".into()));
        }
        if self.spend_window <= 0 {
            return Err(IndexerError::Config("spend_window must be positive".into()));
        }
        Ok(())
    }

    pub fn chain_tip_interval(&self) -> Duration {
        Duration::from_millis(self.chain_tip_interval_ms)
    }

    pub fn download_interval(&self) -> Duration {
        Duration::from_millis(self.download_interval_ms)
    }

    pub fn decompose_interval(&self) -> Duration {
        Duration::from_millis(self.decompose_interval_ms)
    }

    pub fn tx_process_interval(&self) -> Duration {
        Duration::from_millis(self.tx_process_interval_ms)
    }

    pub fn spend_interval(&self) -> Duration {
        Duration::from_millis(self.spend_interval_ms)
    }

    pub fn completeness_interval(&self) -> Duration {
        Duration::from_millis(self.completeness_interval_ms)
    }

    pub fn timeout_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_interval_ms)
    }

    pub fn mempool_sync_interval(&self) -> Duration {
        Duration::from_millis(self.mempool_sync_interval_ms)
    }

    pub fn double_check_interval(&self) -> Duration {
        Duration::from_millis(self.double_check_interval_ms)
    }

    pub fn spend_repair_interval(&self) -> Duration {
        Duration::from_millis(self.spend_repair_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn verify_idle(&self) -> Duration {
        Duration::from_millis(self.verify_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = IndexerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.mempool_retention_secs, 1_209_600);
        assert_eq!(cfg.tx_queue_max, 10_000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = IndexerConfig::from_json(r#"{ "block_cache_size": 50, "start_height": 1000 }"#)
            .unwrap();
        assert_eq!(cfg.block_cache_size, 50);
        assert_eq!(cfg.start_height, Some(1000));
        assert_eq!(cfg.header_batch, 100);
    }

    #[test]
    fn zero_batch_rejected() {
        let err = IndexerConfig::from_json(r#"{ "verify_batch": 0 }"#).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }
}
