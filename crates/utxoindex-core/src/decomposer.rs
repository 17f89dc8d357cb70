//! Block decomposer: turns cached blocks into transaction work items.
//!
//! Each selected block is parsed and checked against its header (hash,
//! transaction count, merkle root). Transactions that are already fully
//! indexed under this block are only flagged `is_completed_check`; the rest
//! are queued for the indexer in block order, the final one marked
//! `is_last`. The block's status and processed count are persisted before
//! anything is queued, so a fast consumer can never complete a block whose
//! bookkeeping has not landed yet.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::cache::BlockCache;
use crate::codec::{verify_merkle, Block};
use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::indexer::{TxIndexer, WorkItem};
use crate::store::IndexStore;
use crate::types::{BlockRecord, ProcessStatus};

const RESTORE_CHUNK: usize = 300;
const LOOKUP_CHUNK: usize = 1000;
const CHECK_CHUNK: usize = 100;

/// Result of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Pending transactions were queued.
    Queued(usize),
    /// Everything was already indexed; the block is `Completed`.
    Completed,
    /// Missing or corrupt cache entry; the block went back to `NoStart`.
    Reset,
    /// The block changed state since it was selected.
    Skipped,
}

/// Totals for one decomposer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecomposeReport {
    pub blocks: usize,
    pub queued: usize,
    pub completed: usize,
    pub reset: usize,
    pub failed: usize,
}

impl DecomposeReport {
    fn record(&mut self, outcome: Result<BlockOutcome, IndexerError>) {
        self.blocks += 1;
        match outcome {
            Ok(BlockOutcome::Queued(n)) => self.queued += n,
            Ok(BlockOutcome::Completed) => self.completed += 1,
            Ok(BlockOutcome::Reset) => self.reset += 1,
            Ok(BlockOutcome::Skipped) => {}
            Err(_) => self.failed += 1,
        }
    }
}

/// Keep blocks, in order, while the queued transactions stay within
/// `max`. The first block is always kept.
pub fn take_within_budget(blocks: Vec<BlockRecord>, queued: usize, max: usize) -> Vec<BlockRecord> {
    let mut total = queued as u64;
    let mut out = Vec::new();
    for block in blocks {
        total += block.num_tx;
        if !out.is_empty() && total > max as u64 {
            break;
        }
        out.push(block);
    }
    out
}

pub struct BlockDecomposer {
    store: Arc<dyn IndexStore>,
    cache: Arc<BlockCache>,
    indexer: Arc<TxIndexer>,
    concurrency: usize,
    select_limit: usize,
}

impl BlockDecomposer {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        cache: Arc<BlockCache>,
        indexer: Arc<TxIndexer>,
    ) -> Self {
        Self {
            store,
            cache,
            indexer,
            concurrency: config.decompose_concurrency.max(1),
            select_limit: config.decompose_select_limit.max(1),
        }
    }

    /// Downloaded blocks first; then blocks stuck in `Processing` behind a
    /// newer completed one; then completed blocks with a short count. The
    /// last two only run on an empty queue, when nothing of theirs can
    /// still be in flight.
    async fn select_candidates(&self) -> Result<Vec<BlockRecord>, IndexerError> {
        let downloaded = self
            .store
            .blocks_by_cursor(ProcessStatus::Downloaded, None, self.select_limit)
            .await?;
        if !downloaded.is_empty() || !self.indexer.block_queue().is_empty() {
            return Ok(downloaded);
        }

        if let Some(newest) = self.store.max_block_cursor(ProcessStatus::Completed).await? {
            let stuck = self
                .store
                .blocks_by_cursor(ProcessStatus::Processing, Some(newest), self.select_limit)
                .await?;
            if !stuck.is_empty() {
                return Ok(stuck);
            }
        }

        self.store.incomplete_completed_blocks(self.select_limit).await
    }

    /// One pass over the selected blocks.
    pub async fn run_pass(&self) -> Result<DecomposeReport, IndexerError> {
        let queue = self.indexer.block_queue();
        if queue.is_full() {
            tracing::debug!(queued = queue.len(), "block queue full, decomposer idle");
            return Ok(DecomposeReport::default());
        }
        let candidates = self.select_candidates().await?;
        let blocks = take_within_budget(candidates, queue.len(), queue.capacity());
        Ok(self.process_all(blocks).await)
    }

    /// Reprocess every block left in `Processing` by a previous run.
    pub async fn resume_pending(&self) -> Result<DecomposeReport, IndexerError> {
        let pending = self
            .store
            .blocks_by_cursor(ProcessStatus::Processing, None, u32::MAX as usize)
            .await?;
        if !pending.is_empty() {
            tracing::info!(blocks = pending.len(), "resuming blocks left in processing");
        }
        Ok(self.process_all(pending).await)
    }

    async fn process_all(&self, blocks: Vec<BlockRecord>) -> DecomposeReport {
        let outcomes: Vec<Result<BlockOutcome, IndexerError>> = stream::iter(blocks)
            .map(|block| async move {
                let result = self.process_block(&block).await;
                if let Err(e) = &result {
                    tracing::warn!(block = %block.hash, height = block.height, error = %e, "block decomposition failed");
                }
                result
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = DecomposeReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        report
    }

    async fn reset(&self, hash: &str) -> Result<BlockOutcome, IndexerError> {
        self.cache.evict(hash).await?;
        self.store
            .set_block_status(hash, ProcessStatus::NoStart, Some(0))
            .await?;
        Ok(BlockOutcome::Reset)
    }

    pub async fn process_block(&self, selected: &BlockRecord) -> Result<BlockOutcome, IndexerError> {
        let Some(block) = self.store.block(&selected.hash).await? else {
            return Ok(BlockOutcome::Skipped);
        };
        if block.is_reorg || !block.process_status.can_transition_to(ProcessStatus::Processing) {
            return Ok(BlockOutcome::Skipped);
        }

        let Some(raw) = self.cache.read(&block.hash).await? else {
            tracing::warn!(block = %block.hash, height = block.height, "cached block missing, scheduling download");
            return self.reset(&block.hash).await;
        };
        let (parsed, txids) = match parse_and_verify(&block, &raw) {
            Ok(ok) => ok,
            Err(e) if e.is_integrity() => {
                tracing::warn!(block = %block.hash, height = block.height, error = %e, "cached block failed verification");
                return self.reset(&block.hash).await;
            }
            Err(e) => return Err(e),
        };

        self.store
            .set_block_status(&block.hash, ProcessStatus::Processing, None)
            .await?;
        for chunk in txids.chunks(RESTORE_CHUNK) {
            self.store.restore_txs(chunk).await?;
        }

        let done = self.indexed_txids(&block.hash, &txids).await?;
        let done_list: Vec<String> = done.iter().cloned().collect();
        for chunk in done_list.chunks(CHECK_CHUNK) {
            self.store.mark_completed_check(chunk).await?;
        }

        let mut items: Vec<WorkItem> = parsed
            .transactions
            .into_iter()
            .zip(txids)
            .filter(|(_, txid)| !done.contains(txid))
            .map(|(tx, txid)| WorkItem {
                block_hash: block.hash.clone(),
                block_height: block.height,
                block_tx_count: block.num_tx,
                txid,
                tx,
                is_last: false,
            })
            .collect();

        self.store
            .set_block_status(&block.hash, ProcessStatus::Processing, Some(done.len() as u64))
            .await?;

        let Some(last) = items.last_mut() else {
            self.indexer
                .complete_block(&block.hash, block.height, block.num_tx)
                .await?;
            return Ok(BlockOutcome::Completed);
        };
        last.is_last = true;

        let queued = items.len();
        tracing::debug!(block = %block.hash, height = block.height, queued, indexed = done.len(), "block decomposed");
        self.indexer.enqueue_block_items(items);
        Ok(BlockOutcome::Queued(queued))
    }

    /// Txids with an active row under `block_hash` whose live children match
    /// the declared counts.
    async fn indexed_txids(
        &self,
        block_hash: &str,
        txids: &[String],
    ) -> Result<HashSet<String>, IndexerError> {
        let mut done = HashSet::new();
        for chunk in txids.chunks(LOOKUP_CHUNK) {
            let rows = self.store.active_txs(chunk).await?;
            let counts = self.store.child_counts(chunk).await?;
            for row in rows {
                if row.block_hash.as_deref() != Some(block_hash) {
                    continue;
                }
                let live = counts.get(&row.txid).copied().unwrap_or_default();
                if row.is_complete(live) {
                    done.insert(row.txid);
                }
            }
        }
        Ok(done)
    }
}

/// Parse a cached block and check it against its stored header.
fn parse_and_verify(
    block: &BlockRecord,
    raw: &[u8],
) -> Result<(Block, Vec<String>), IndexerError> {
    let parsed = Block::parse(raw)?;
    let hash = parsed.header.hash();
    if hash != block.hash {
        return Err(IndexerError::Decode(format!(
            "cached block hashes to {hash}, expected {}",
            block.hash
        )));
    }
    if parsed.transactions.len() as u64 != block.num_tx {
        return Err(IndexerError::Decode(format!(
            "block {} has {} transactions, header declares {}",
            block.hash,
            parsed.transactions.len(),
            block.num_tx
        )));
    }
    let txids = parsed.txids()?;
    verify_merkle(&block.hash, &block.merkle_root, &txids)?;
    Ok((parsed, txids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    fn block(hash: &str, num_tx: u64) -> BlockRecord {
        BlockRecord::from_header(&BlockHeader {
            hash: hash.into(),
            height: 1,
            size: None,
            version_hex: String::new(),
            merkle_root: String::new(),
            num_tx,
            time: 0,
            median_time: 0,
            nonce: 0,
            bits: String::new(),
            difficulty: 0.0,
            chainwork: String::new(),
            previous_block_hash: None,
        })
    }

    #[test]
    fn budget_keeps_first_block_even_when_oversized() {
        let picked = take_within_budget(vec![block("a", 50), block("b", 1)], 0, 10);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].hash, "a");
    }

    #[test]
    fn budget_counts_already_queued_items() {
        let blocks = vec![block("a", 3), block("b", 3), block("c", 3)];
        let picked = take_within_budget(blocks, 2, 8);
        let hashes: Vec<_> = picked.iter().map(|b| b.hash.as_str()).collect();
        assert_eq!(hashes, ["a", "b"]);
    }

    #[test]
    fn parse_rejects_wrong_hash() {
        let record = block("00", 0);
        assert!(parse_and_verify(&record, &[0u8; 81]).unwrap_err().is_integrity());
    }
}
