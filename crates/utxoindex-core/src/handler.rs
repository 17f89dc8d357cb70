//! Observer traits for indexing events + registry.
//!
//! Handlers see a transaction once its rows are written, a block once it is
//! fully indexed, and every applied reorg. A failing handler is logged and
//! skipped: notification never blocks indexing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::IndexerError;
use crate::reorg::ReorgEvent;

/// A transaction whose rows were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedTx {
    pub txid: String,
    /// `None` for the mempool path.
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
}

/// A block whose transactions are all indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedBlock {
    pub hash: String,
    pub height: u64,
    pub tx_count: u64,
}

#[async_trait]
pub trait TxHandler: Send + Sync {
    async fn on_tx(&self, tx: &IndexedTx) -> Result<(), IndexerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "tx-handler"
    }
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn on_block(&self, block: &CompletedBlock) -> Result<(), IndexerError>;

    fn name(&self) -> &str {
        "block-handler"
    }
}

#[async_trait]
pub trait ReorgHandler: Send + Sync {
    async fn on_reorg(&self, event: &ReorgEvent) -> Result<(), IndexerError>;

    fn name(&self) -> &str {
        "reorg-handler"
    }
}

/// Registry of tx + block + reorg handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    tx_handlers: Vec<Arc<dyn TxHandler>>,
    block_handlers: Vec<Arc<dyn BlockHandler>>,
    reorg_handlers: Vec<Arc<dyn ReorgHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tx(&mut self, handler: Arc<dyn TxHandler>) {
        self.tx_handlers.push(handler);
    }

    pub fn on_block(&mut self, handler: Arc<dyn BlockHandler>) {
        self.block_handlers.push(handler);
    }

    pub fn on_reorg(&mut self, handler: Arc<dyn ReorgHandler>) {
        self.reorg_handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.tx_handlers.is_empty()
            && self.block_handlers.is_empty()
            && self.reorg_handlers.is_empty()
    }

    pub async fn dispatch_tx(&self, tx: &IndexedTx) {
        for handler in &self.tx_handlers {
            if let Err(e) = handler.on_tx(tx).await {
                tracing::warn!(handler = handler.name(), txid = %tx.txid, error = %e, "tx handler failed");
            }
        }
    }

    pub async fn dispatch_block(&self, block: &CompletedBlock) {
        for handler in &self.block_handlers {
            if let Err(e) = handler.on_block(block).await {
                tracing::warn!(handler = handler.name(), block = %block.hash, error = %e, "block handler failed");
            }
        }
    }

    pub async fn dispatch_reorg(&self, event: &ReorgEvent) {
        for handler in &self.reorg_handlers {
            if let Err(e) = handler.on_reorg(event).await {
                tracing::warn!(handler = handler.name(), fork = %event.fork_hash, error = %e, "reorg handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl TxHandler for Counter {
        async fn on_tx(&self, _tx: &IndexedTx) -> Result<(), IndexerError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl TxHandler for Failing {
        async fn on_tx(&self, _tx: &IndexedTx) -> Result<(), IndexerError> {
            Err(IndexerError::Other("webhook down".into()))
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.on_tx(Arc::new(Failing));
        registry.on_tx(Arc::new(Counter(count.clone())));

        let tx = IndexedTx {
            txid: "aa".into(),
            block_hash: None,
            block_height: None,
        };
        registry.dispatch_tx(&tx).await;
        registry.dispatch_tx(&tx).await;

        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert!(!registry.is_empty());
    }
}
