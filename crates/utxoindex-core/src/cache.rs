//! Block fetch/cache manager.
//!
//! Keeps up to `block_cache_size` blocks downloaded ahead of the decomposer,
//! one `{hash}.bin` file per block.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::node::NodeClient;
use crate::store::IndexStore;
use crate::types::{BlockRecord, ProcessStatus};

// ─── BlockCache ───────────────────────────────────────────────────────────────

/// On-disk block file cache.
#[derive(Debug, Clone)]
pub struct BlockCache {
    dir: PathBuf,
}

impl BlockCache {
    /// Open the cache directory, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, IndexerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.bin"))
    }

    /// Cached block bytes, or `None` when the file is missing.
    pub async fn read(&self, hash: &str) -> Result<Option<Vec<u8>>, IndexerError> {
        match tokio::fs::read(self.path_for(hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains(&self, hash: &str) -> bool {
        tokio::fs::metadata(self.path_for(hash)).await.is_ok()
    }

    /// Remove a cached block. Missing files are fine.
    pub async fn evict(&self, hash: &str) -> Result<(), IndexerError> {
        match tokio::fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── BlockFetcher ─────────────────────────────────────────────────────────────

/// Downloads pending blocks into the cache.
pub struct BlockFetcher {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    cache: Arc<BlockCache>,
    cache_size: usize,
    concurrency: usize,
    recycle_threshold: u64,
}

impl BlockFetcher {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        cache: Arc<BlockCache>,
    ) -> Self {
        Self {
            store,
            node,
            cache,
            cache_size: config.block_cache_size,
            concurrency: config.download_concurrency.max(1),
            recycle_threshold: config.completed_recycle_threshold,
        }
    }

    /// One download pass. Returns the number of blocks downloaded.
    pub async fn run_pass(&self) -> Result<usize, IndexerError> {
        let completed = self.store.count_blocks(ProcessStatus::Completed).await?;
        if completed > self.recycle_threshold {
            let recycled = self.store.recycle_completed().await?;
            tracing::info!(recycled, "recycled completed blocks");
        }

        let downloaded = self.store.count_blocks(ProcessStatus::Downloaded).await? as usize;
        let need = self.cache_size.saturating_sub(downloaded);
        if need == 0 {
            return Ok(0);
        }

        let pending = self
            .store
            .blocks_by_height(&[ProcessStatus::NoStart, ProcessStatus::Downloading], need)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let results: Vec<bool> = stream::iter(pending)
            .map(|block| self.fetch_one(block))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        Ok(results.into_iter().filter(|ok| *ok).count())
    }

    async fn fetch_one(&self, block: BlockRecord) -> bool {
        match self.try_fetch(&block).await {
            Ok(size) => {
                tracing::debug!(block = %block.hash, height = block.height, size, "block downloaded");
                true
            }
            Err(e) => {
                tracing::warn!(block = %block.hash, height = block.height, error = %e, "block download failed");
                if let Err(e) = self.cache.evict(&block.hash).await {
                    tracing::warn!(block = %block.hash, error = %e, "failed to remove partial block file");
                }
                false
            }
        }
    }

    async fn try_fetch(&self, block: &BlockRecord) -> Result<u64, IndexerError> {
        let status = block.process_status.transition(ProcessStatus::Downloading)?;
        self.store.set_block_status(&block.hash, status, None).await?;
        let size = self
            .node
            .download_block(&block.hash, &self.cache.path_for(&block.hash))
            .await?;
        let status = status.transition(ProcessStatus::Downloaded)?;
        self.store.set_block_status(&block.hash, status, None).await?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_read_evict() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::open(dir.path().join("blocks")).await.unwrap();
        assert!(cache.read("aa").await.unwrap().is_none());

        tokio::fs::write(cache.path_for("aa"), b"raw").await.unwrap();
        assert!(cache.contains("aa").await);
        assert_eq!(cache.read("aa").await.unwrap().unwrap(), b"raw");

        cache.evict("aa").await.unwrap();
        cache.evict("aa").await.unwrap();
        assert!(!cache.contains("aa").await);
    }
}
