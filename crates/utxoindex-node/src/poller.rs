//! Polling event producer.
//!
//! Nodes without a push feed are watched by polling: a changed best block
//! hash becomes `HashBlock`, every mempool txid not seen on the previous
//! poll is fetched and published as `RawTx`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};

use utxoindex_core::node::{NodeClient, NodeEvent};
use utxoindex_core::IndexerError;

use crate::events::ChannelEventSource;

/// Totals for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub new_block: bool,
    pub published: usize,
    pub failed: usize,
}

#[derive(Default)]
struct PollState {
    best: Option<String>,
    seen: HashSet<String>,
}

pub struct NodePoller {
    node: Arc<dyn NodeClient>,
    feed: ChannelEventSource,
    concurrency: usize,
    state: Mutex<PollState>,
}

impl NodePoller {
    pub fn new(node: Arc<dyn NodeClient>, feed: ChannelEventSource, concurrency: usize) -> Self {
        Self {
            node,
            feed,
            concurrency: concurrency.max(1),
            state: Mutex::new(PollState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PollState> {
        // state is a cache, a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn poll_once(&self) -> Result<PollReport, IndexerError> {
        let mut report = PollReport::default();

        let best = self.node.best_block_hash().await?;
        let changed = {
            let mut state = self.state();
            let changed = state.best.as_deref() != Some(best.as_str());
            state.best = Some(best.clone());
            changed
        };
        if changed {
            self.feed.publish(NodeEvent::HashBlock(best));
            report.new_block = true;
        }

        let mempool = self.node.raw_mempool().await?;
        let fresh: Vec<String> = {
            let state = self.state();
            mempool
                .iter()
                .filter(|txid| !state.seen.contains(*txid))
                .cloned()
                .collect()
        };

        let fetched: Vec<(String, Result<Vec<u8>, IndexerError>)> = stream::iter(fresh)
            .map(|txid| async move {
                let raw = match self.node.raw_transaction_rest(&txid).await {
                    Ok(raw) => Ok(raw),
                    Err(_) => self.node.raw_transaction(&txid).await,
                };
                (txid, raw)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failed = HashSet::new();
        for (txid, raw) in fetched {
            match raw {
                Ok(raw) => {
                    self.feed.publish(NodeEvent::RawTx(raw));
                    report.published += 1;
                }
                Err(e) => {
                    tracing::debug!(%txid, error = %e, "mempool transaction fetch failed");
                    failed.insert(txid);
                    report.failed += 1;
                }
            }
        }

        // Only the current mempool is remembered; failures are retried.
        self.state().seen = mempool.into_iter().filter(|t| !failed.contains(t)).collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use futures::StreamExt;
    use utxoindex_core::node::EventSource;
    use utxoindex_core::types::{BlockHeader, BlockchainInfo, MempoolInfo};

    #[derive(Default)]
    struct ScriptedNode {
        best: Mutex<String>,
        mempool: Mutex<Vec<String>>,
        broken: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl NodeClient for ScriptedNode {
        async fn best_block_hash(&self) -> Result<String, IndexerError> {
            Ok(self.best.lock().unwrap().clone())
        }
        async fn block_header(&self, _hash: &str) -> Result<BlockHeader, IndexerError> {
            Err(IndexerError::Rpc("unused".into()))
        }
        async fn raw_mempool(&self) -> Result<Vec<String>, IndexerError> {
            Ok(self.mempool.lock().unwrap().clone())
        }
        async fn mempool_info(&self) -> Result<MempoolInfo, IndexerError> {
            Ok(MempoolInfo::default())
        }
        async fn blockchain_info(&self) -> Result<BlockchainInfo, IndexerError> {
            Ok(BlockchainInfo::default())
        }
        async fn raw_transaction_rest(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
            if self.broken.lock().unwrap().contains(txid) {
                return Err(IndexerError::Rest("404".into()));
            }
            Ok(txid.as_bytes().to_vec())
        }
        async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
            Err(IndexerError::Rpc(format!("no such transaction {txid}")))
        }
        async fn download_block(&self, _hash: &str, _dest: &Path) -> Result<u64, IndexerError> {
            Err(IndexerError::Rest("unused".into()))
        }
    }

    #[tokio::test]
    async fn publishes_new_blocks_and_unseen_transactions() {
        let node = Arc::new(ScriptedNode::default());
        *node.best.lock().unwrap() = "b1".into();
        *node.mempool.lock().unwrap() = vec!["t1".into(), "t2".into()];
        node.broken.lock().unwrap().insert("t2".into());

        let feed = ChannelEventSource::new(16);
        let mut events = feed.subscribe().await.unwrap();
        let poller = NodePoller::new(node.clone(), feed.clone(), 2);

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first, PollReport { new_block: true, published: 1, failed: 1 });
        assert_eq!(events.next().await, Some(NodeEvent::HashBlock("b1".into())));
        assert_eq!(events.next().await, Some(NodeEvent::RawTx(b"t1".to_vec())));

        // same tip, t1 already seen, t2 now fetchable
        node.broken.lock().unwrap().clear();
        let second = poller.poll_once().await.unwrap();
        assert_eq!(second, PollReport { new_block: false, published: 1, failed: 0 });
        assert_eq!(events.next().await, Some(NodeEvent::RawTx(b"t2".to_vec())));

        *node.best.lock().unwrap() = "b2".into();
        let third = poller.poll_once().await.unwrap();
        assert_eq!(third, PollReport { new_block: true, published: 0, failed: 0 });
    }
}
