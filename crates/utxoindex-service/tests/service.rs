//! Service wiring: events in, loops running, clean shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use utxoindex_core::codec::{Transaction, TxInput, TxOutput};
use utxoindex_core::script::build;
use utxoindex_core::types::{BlockHeader, BlockchainInfo, MempoolInfo};
use utxoindex_core::{
    IndexStore, IndexedTx, IndexerConfig, IndexerError, MemoryStore, NodeClient, TxHandler,
};
use utxoindex_node::ChannelEventSource;
use utxoindex_service::IndexerBuilder;

/// A node that is never reachable.
struct OfflineNode;

fn offline<T>() -> Result<T, IndexerError> {
    Err(IndexerError::Rpc("connection refused".into()))
}

#[async_trait]
impl NodeClient for OfflineNode {
    async fn best_block_hash(&self) -> Result<String, IndexerError> {
        offline()
    }
    async fn block_header(&self, _hash: &str) -> Result<BlockHeader, IndexerError> {
        offline()
    }
    async fn raw_mempool(&self) -> Result<Vec<String>, IndexerError> {
        offline()
    }
    async fn mempool_info(&self) -> Result<MempoolInfo, IndexerError> {
        offline()
    }
    async fn blockchain_info(&self) -> Result<BlockchainInfo, IndexerError> {
        offline()
    }
    async fn raw_transaction_rest(&self, _txid: &str) -> Result<Vec<u8>, IndexerError> {
        offline()
    }
    async fn raw_transaction(&self, _txid: &str) -> Result<Vec<u8>, IndexerError> {
        offline()
    }
    async fn download_block(&self, _hash: &str, _dest: &Path) -> Result<u64, IndexerError> {
        offline()
    }
}

#[derive(Default)]
struct CountingHandler {
    seen: AtomicUsize,
}

#[async_trait]
impl TxHandler for CountingHandler {
    async fn on_tx(&self, _tx: &IndexedTx) -> Result<(), IndexerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn mempool_tx() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_txid: "ab".repeat(32),
            prev_index: 0,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: 1_000,
            script: build::p2pkh([0x11; 20]),
        }],
        lock_time: 0,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn mempool_events_are_indexed_once_and_service_stops() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(ChannelEventSource::new(64));
    let handler = Arc::new(CountingHandler::default());

    let config = IndexerConfig {
        block_cache_dir: dir.path().join("blocks"),
        tx_process_interval_ms: 5,
        chain_tip_interval_ms: 50,
        download_interval_ms: 50,
        decompose_interval_ms: 50,
        ..Default::default()
    };
    let service = IndexerBuilder::new()
        .config(config)
        .store(store.clone())
        .node(Arc::new(OfflineNode))
        .events(feed.clone())
        .on_tx(handler.clone())
        .build()
        .await
        .unwrap();
    assert!(dir.path().join("blocks").is_dir());

    let handle = service.start().await.unwrap();
    assert!(!handle.is_empty());
    eventually("event subscription", || {
        let feed = feed.clone();
        async move { feed.subscriber_count() > 0 }
    })
    .await;

    let tx = mempool_tx();
    let txid = tx.txid().unwrap();
    let raw = tx.serialize().unwrap();
    feed.raw_tx(raw.clone());
    feed.raw_tx(raw);
    // undecodable payloads are dropped without stopping the loop
    feed.raw_tx(vec![0xde, 0xad]);

    eventually("mempool transaction row", || {
        let store = store.clone();
        let txid = txid.clone();
        async move { !store.active_txs(&[txid]).await.unwrap().is_empty() }
    })
    .await;

    tokio::time::timeout(Duration::from_secs(10), handle.stop())
        .await
        .expect("service should stop");
    assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    assert_eq!(store.child_counts(&[txid]).await.unwrap().len(), 1);
}
