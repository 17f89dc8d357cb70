//! utxoindex-core — the indexing pipeline for a UTXO chain follower.
//!
//! # Architecture
//!
//! ```text
//! NodeClient ──► ChainTipTracker   (header chain, reorgs)
//!            ──► BlockFetcher      (BlockCache, {hash}.bin)
//!                    └─► BlockDecomposer (merkle check, idempotency)
//!                            └─► TxIndexer ◄── mempool raw txs (EventSource)
//!                                   ├── block WorkQueue, batched upserts
//!                                   └── spend marking
//!                Reconciler        (completeness, timeout, mempool sync,
//!                                   double-check, spend repair)
//!                TokenVerifier     (fungible token provenance)
//!
//! every component ──► IndexStore (memory / SQLite)
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod handler;
pub mod indexer;
pub mod memory;
pub mod node;
pub mod queue;
pub mod reconciler;
pub mod reorg;
pub mod script;
pub mod store;
pub mod tracker;
pub mod types;
pub mod verifier;

pub use cache::{BlockCache, BlockFetcher};
pub use config::IndexerConfig;
pub use decomposer::{BlockDecomposer, DecomposeReport};
pub use error::IndexerError;
pub use handler::{BlockHandler, CompletedBlock, HandlerRegistry, IndexedTx, ReorgHandler, TxHandler};
pub use indexer::{IngestMode, TxIndexer, WorkItem};
pub use memory::MemoryStore;
pub use node::{EventSource, NodeClient, NodeEvent, NodeEventStream};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use reorg::{ReorgEvent, ReorgPlan};
pub use store::IndexStore;
pub use tracker::{ChainTipTracker, TipOutcome};
pub use types::{BlockRecord, ProcessStatus, TokenCheck};
pub use verifier::{TokenVerifier, VerifyReport};
