//! Full-node boundary: request/response calls and the push event feed.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::IndexerError;
use crate::types::{BlockHeader, BlockchainInfo, MempoolInfo};

/// Calls the indexer makes against a full node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `getbestblockhash`
    async fn best_block_hash(&self) -> Result<String, IndexerError>;

    /// Verbose `getblockheader`.
    async fn block_header(&self, hash: &str) -> Result<BlockHeader, IndexerError>;

    /// `getrawmempool`
    async fn raw_mempool(&self) -> Result<Vec<String>, IndexerError>;

    /// `getmempoolinfo`
    async fn mempool_info(&self) -> Result<MempoolInfo, IndexerError>;

    /// `getblockchaininfo`
    async fn blockchain_info(&self) -> Result<BlockchainInfo, IndexerError>;

    /// Raw transaction bytes over the REST interface.
    async fn raw_transaction_rest(&self, txid: &str) -> Result<Vec<u8>, IndexerError>;

    /// Raw transaction bytes over `getrawtransaction`.
    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError>;

    /// Store the serialized block at `dest`. Returns its size in bytes.
    async fn download_block(&self, hash: &str, dest: &Path) -> Result<u64, IndexerError>;
}

/// A notification pushed by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A transaction entered the mempool.
    RawTx(Vec<u8>),
    /// A new block was connected.
    HashBlock(String),
}

pub type NodeEventStream = Pin<Box<dyn Stream<Item = NodeEvent> + Send>>;

/// A subscription to node events. The stream ends when the feed drops;
/// callers resubscribe.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<NodeEventStream, IndexerError>;
}
