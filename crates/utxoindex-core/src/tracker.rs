//! Chain-tip tracker — keeps the stored header chain linked to the node's
//! best chain.
//!
//! One pass:
//! 1. **Bootstrap** (empty store): store the node's best header as tip, then
//!    backfill toward the first block (or the configured start height).
//! 2. **Resume**: continue backfill from the current tail.
//! 3. **Advance**: walk back from the node's best hash to the first stored
//!    header. If that header is the tip, append the new headers; otherwise
//!    plan and apply a reorg.

use std::sync::Arc;

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::handler::HandlerRegistry;
use crate::node::NodeClient;
use crate::reorg::{plan_reorg, ReorgEvent};
use crate::store::IndexStore;
use crate::types::BlockRecord;

/// What a tracker pass changed.
#[derive(Debug, Clone)]
pub enum TipOutcome {
    /// The stored tip already matches the node.
    Unchanged,
    /// New headers were appended on top of the tip.
    Extended { added: usize, tip: String, height: u64 },
    /// The active chain switched branches.
    Reorged(ReorgEvent),
}

pub struct ChainTipTracker {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    handlers: Arc<HandlerRegistry>,
    header_batch: usize,
    tip_batch: usize,
    start_height: Option<u64>,
}

impl ChainTipTracker {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            node,
            handlers,
            header_batch: config.header_batch.max(1),
            tip_batch: config.tip_batch.max(2),
            start_height: config.start_height,
        }
    }

    pub async fn run_pass(&self) -> Result<TipOutcome, IndexerError> {
        let tip = self.store.chain_tip().await?;
        let tail = self.store.tail().await?;
        match (tip, tail) {
            (None, None) => self.bootstrap().await?,
            (Some(_), Some(tail)) if self.can_extend_back(&tail) => {
                let prev = tail.prev_hash.clone();
                self.backfill(prev, vec![tail]).await?;
            }
            _ => {}
        }
        self.advance().await
    }

    fn below_floor(&self, height: u64) -> bool {
        self.start_height.is_some_and(|h| height <= h)
    }

    fn can_extend_back(&self, tail: &BlockRecord) -> bool {
        tail.is_tail && tail.prev_hash.is_some() && !self.below_floor(tail.height)
    }

    // ─── Backfill ─────────────────────────────────────────────────────────────

    async fn bootstrap(&self) -> Result<(), IndexerError> {
        let best = self.node.best_block_hash().await?;
        let header = self.node.block_header(&best).await?;
        let mut record = BlockRecord::from_header(&header);
        record.is_chaintips = true;
        record.is_tail = record.prev_hash.is_none() || self.below_floor(record.height);
        self.store.save_blocks(std::slice::from_ref(&record)).await?;
        tracing::info!(block = %record.hash, height = record.height, "bootstrapped chain tip");

        if !record.is_tail {
            let prev = record.prev_hash.clone();
            self.backfill(prev, vec![record]).await?;
        }
        Ok(())
    }

    /// Walk back from `prev`, storing headers in batches. The oldest header
    /// of each batch takes over the tail flag from `before`.
    async fn backfill(
        &self,
        prev: Option<String>,
        mut before: Vec<BlockRecord>,
    ) -> Result<(), IndexerError> {
        let mut next = prev;
        while let Some(start) = next.take() {
            let mut batch: Vec<BlockRecord> = Vec::with_capacity(self.header_batch);
            let mut cursor = Some(start);
            let mut linked_to_known = false;

            while batch.len() < self.header_batch {
                let Some(hash) = cursor.take() else { break };
                if self.store.block(&hash).await?.is_some() {
                    linked_to_known = true;
                    break;
                }
                let header = self.node.block_header(&hash).await?;
                let record = BlockRecord::from_header(&header);
                if !self.below_floor(record.height) {
                    cursor = record.prev_hash.clone();
                }
                batch.push(record);
            }

            if !linked_to_known {
                if let Some(oldest) = batch.last_mut() {
                    oldest.is_tail = true;
                }
            }
            let oldest = batch.last().cloned();

            let mut rows: Vec<BlockRecord> = before
                .drain(..)
                .map(|mut b| {
                    b.is_tail = false;
                    b
                })
                .collect();
            rows.extend(batch);
            if rows.is_empty() {
                break;
            }
            self.store.save_blocks(&rows).await?;

            match oldest {
                Some(oldest) if !linked_to_known => {
                    tracing::debug!(tail = %oldest.hash, height = oldest.height, "backfilled headers");
                    next = cursor;
                    before = vec![oldest];
                }
                _ => break,
            }
        }
        Ok(())
    }

    // ─── Advance ──────────────────────────────────────────────────────────────

    async fn advance(&self) -> Result<TipOutcome, IndexerError> {
        let best = self.node.best_block_hash().await?;

        // Unknown headers, newest first.
        let mut linked = Vec::new();
        let mut hash = best.clone();
        let known = loop {
            if let Some(record) = self.store.block(&hash).await? {
                break record;
            }
            let header = self.node.block_header(&hash).await?;
            let record = BlockRecord::from_header(&header);
            let prev = record.prev_hash.clone();
            linked.push(record);
            hash = prev.ok_or_else(|| {
                IndexerError::Other(format!("best block {best} shares no ancestor with the index"))
            })?;
        };

        if known.is_chaintips && !known.is_reorg {
            if linked.is_empty() {
                return Ok(TipOutcome::Unchanged);
            }
            self.extend(known, linked).await
        } else {
            self.reorganize(known, linked).await.map(TipOutcome::Reorged)
        }
    }

    /// Append `linked` (newest first) on top of `tip`, moving the tip flag
    /// forward one batch at a time so an interrupted pass leaves a valid tip.
    async fn extend(
        &self,
        tip: BlockRecord,
        linked: Vec<BlockRecord>,
    ) -> Result<TipOutcome, IndexerError> {
        let added = linked.len();
        let mut chain = Vec::with_capacity(added + 1);
        chain.push(tip);
        chain.extend(linked.into_iter().rev());

        let mut i = 0;
        while i < chain.len() {
            let start = i.saturating_sub(1);
            let end = (i + self.tip_batch).min(chain.len());
            let mut rows = chain[start..end].to_vec();
            let last = rows.len() - 1;
            for (j, row) in rows.iter_mut().enumerate() {
                row.is_reorg = false;
                row.is_chaintips = j == last;
            }
            self.store.save_blocks(&rows).await?;
            i += self.tip_batch;
        }

        let new_tip = &chain[chain.len() - 1];
        tracing::info!(block = %new_tip.hash, height = new_tip.height, added, "chain tip advanced");
        Ok(TipOutcome::Extended {
            added,
            tip: new_tip.hash.clone(),
            height: new_tip.height,
        })
    }

    async fn reorganize(
        &self,
        known: BlockRecord,
        linked: Vec<BlockRecord>,
    ) -> Result<ReorgEvent, IndexerError> {
        // Stored blocks of the new branch dropped by an earlier reorg.
        let mut revived = Vec::new();
        let mut fork = known;
        while fork.is_reorg {
            let prev = fork.prev_hash.clone().ok_or_else(|| {
                IndexerError::Other(format!("reorged block {} has no parent", fork.hash))
            })?;
            let parent = self.store.block(&prev).await?.ok_or_else(|| {
                IndexerError::Other(format!("parent {prev} of reorged block {} is not stored", fork.hash))
            })?;
            revived.push(fork);
            fork = parent;
        }

        let mut superseded = Vec::new();
        let mut cursor = fork.hash.clone();
        while let Some(next) = self.store.active_successor(&cursor).await? {
            cursor = next.hash.clone();
            superseded.push(next);
        }

        let plan = plan_reorg(&fork, linked, revived, superseded);
        let dropped = &plan.event.dropped;
        let revived_hashes = plan.revived_hashes();

        // Transaction rows first: a crash before the flag writes replays the
        // same reorg on the next pass.
        let purged = self.store.purge_coinbase_txs(dropped).await?;
        let hidden = self.store.set_block_txs_deleted(dropped, true).await?;
        if !revived_hashes.is_empty() {
            self.store.set_block_txs_deleted(&revived_hashes, false).await?;
        }
        self.store.set_block_flags(&plan.flags).await?;
        self.store.save_blocks(&plan.new_blocks).await?;

        tracing::warn!(
            fork = %plan.event.fork_hash,
            fork_height = plan.event.fork_height,
            depth = plan.event.depth,
            new_tip = %plan.event.new_tip,
            purged_coinbase = purged.len(),
            hidden_txs = hidden,
            "chain reorganization applied"
        );
        self.handlers.dispatch_reorg(&plan.event).await;
        Ok(plan.event)
    }
}
