//! Fluent builder for an [`IndexerService`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use utxoindex_service::IndexerBuilder;
//! # use utxoindex_core::NodeClient;
//!
//! # async fn example(node: Arc<dyn NodeClient>) -> Result<(), utxoindex_core::IndexerError> {
//! let service = IndexerBuilder::new()
//!     .start_height(80_000)
//!     .block_cache_dir("/var/lib/utxoindex/blocks")
//!     .block_cache_size(40)
//!     .node(node)
//!     .build()
//!     .await?;
//! service.run().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use utxoindex_core::{
    BlockHandler, EventSource, HandlerRegistry, IndexStore, IndexerConfig, IndexerError,
    MemoryStore, NodeClient, ReorgHandler, TxHandler,
};

use crate::service::IndexerService;

#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    store: Option<Arc<dyn IndexStore>>,
    node: Option<Arc<dyn NodeClient>>,
    events: Option<Arc<dyn EventSource>>,
    handlers: HandlerRegistry,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Do not backfill headers at or below this height.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = Some(height);
        self
    }

    pub fn block_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.block_cache_dir = dir.into();
        self
    }

    /// Blocks kept downloaded ahead of processing.
    pub fn block_cache_size(mut self, blocks: usize) -> Self {
        self.config.block_cache_size = blocks;
        self
    }

    pub fn chain_tip_interval_ms(mut self, ms: u64) -> Self {
        self.config.chain_tip_interval_ms = ms;
        self
    }

    pub fn download_interval_ms(mut self, ms: u64) -> Self {
        self.config.download_interval_ms = ms;
        self
    }

    pub fn tx_process_interval_ms(mut self, ms: u64) -> Self {
        self.config.tx_process_interval_ms = ms;
        self
    }

    pub fn store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn node(mut self, node: Arc<dyn NodeClient>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn on_tx(mut self, handler: Arc<dyn TxHandler>) -> Self {
        self.handlers.on_tx(handler);
        self
    }

    pub fn on_block(mut self, handler: Arc<dyn BlockHandler>) -> Self {
        self.handlers.on_block(handler);
        self
    }

    pub fn on_reorg(mut self, handler: Arc<dyn ReorgHandler>) -> Self {
        self.handlers.on_reorg(handler);
        self
    }

    /// The configuration as built so far.
    pub fn build_config(&self) -> IndexerConfig {
        self.config.clone()
    }

    /// Assemble the service. A node client is required; without a store
    /// the index lives in memory.
    pub async fn build(self) -> Result<IndexerService, IndexerError> {
        let node = self
            .node
            .ok_or_else(|| IndexerError::Config("a node client is required".into()))?;
        let store = match self.store {
            Some(store) => store,
            None => {
                tracing::info!("no store configured, indexing into memory");
                Arc::new(MemoryStore::new()) as Arc<dyn IndexStore>
            }
        };
        IndexerService::new(self.config, store, node, self.events, self.handlers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.block_cache_size, 20);
        assert_eq!(cfg.header_batch, 100);
        assert!(cfg.start_height.is_none());
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .start_height(1_000)
            .block_cache_dir("/tmp/blocks")
            .block_cache_size(5)
            .chain_tip_interval_ms(250)
            .tx_process_interval_ms(50)
            .build_config();
        assert_eq!(cfg.start_height, Some(1_000));
        assert_eq!(cfg.block_cache_dir, PathBuf::from("/tmp/blocks"));
        assert_eq!(cfg.block_cache_size, 5);
        assert_eq!(cfg.chain_tip_interval_ms, 250);
        assert_eq!(cfg.tx_process_interval_ms, 50);
    }

    #[tokio::test]
    async fn node_is_required() {
        let err = IndexerBuilder::new().build().await.err().unwrap();
        assert!(matches!(err, IndexerError::Config(_)));
    }
}
