//! Reconciliation loops that keep the index honest after partial writes,
//! lost notifications and long-lived mempool entries.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::indexer::{IngestMode, TxIndexer};
use crate::node::NodeClient;
use crate::store::IndexStore;
use crate::types::{ProcessStatus, SyncProgress, TxRecord};

const LOOKUP_CHUNK: usize = 1000;

/// Totals for a completeness or timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub checked: usize,
    pub deleted: usize,
}

/// Totals for a full mempool sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MempoolSyncReport {
    pub in_mempool: usize,
    pub missing: usize,
    pub inconsistent: usize,
    pub ingested: usize,
    pub failed: usize,
}

/// Totals for a block double-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoubleCheckReport {
    pub verified: usize,
    pub reset: usize,
}

pub struct Reconciler {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    indexer: Arc<TxIndexer>,
    sweep_page: usize,
    retention_secs: i64,
    fetch_concurrency: usize,
    double_check_batch: usize,
}

impl Reconciler {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        indexer: Arc<TxIndexer>,
    ) -> Self {
        Self {
            store,
            node,
            indexer,
            sweep_page: config.sweep_page.max(1),
            retention_secs: config.mempool_retention_secs,
            fetch_concurrency: config.mempool_fetch_concurrency.max(1),
            double_check_batch: config.double_check_batch.max(1),
        }
    }

    // ─── Completeness ─────────────────────────────────────────────────────────

    /// Check every unconfirmed, unchecked transaction against its live child
    /// rows: complete rows are flagged checked, incomplete rows are hidden.
    pub async fn completeness_sweep(&self) -> Result<SweepReport, IndexerError> {
        let mut report = SweepReport::default();
        let mut cursor = 0;
        loop {
            let page = self.store.unconfirmed_unchecked(cursor, self.sweep_page).await?;
            let Some(last) = page.last() else { break };
            cursor = last.cursor_id;
            let short = page.len() < self.sweep_page;
            report.scanned += page.len();

            let (complete, broken) = self.split_by_completeness(page).await?;
            if !complete.is_empty() {
                self.store.mark_completed_check(&complete).await?;
                report.checked += complete.len();
            }
            if !broken.is_empty() {
                tracing::debug!(txs = broken.len(), "hiding incomplete mempool transactions");
                self.store.soft_delete_txs(&broken).await?;
                report.deleted += broken.len();
            }
            if short {
                break;
            }
        }
        if report.deleted > 0 {
            tracing::info!(scanned = report.scanned, deleted = report.deleted, "completeness sweep");
        }
        Ok(report)
    }

    async fn split_by_completeness(
        &self,
        rows: Vec<TxRecord>,
    ) -> Result<(Vec<String>, Vec<String>), IndexerError> {
        let txids: Vec<String> = rows.iter().map(|r| r.txid.clone()).collect();
        let counts = self.store.child_counts(&txids).await?;
        let mut complete = Vec::new();
        let mut broken = Vec::new();
        for row in rows {
            let live = counts.get(&row.txid).copied().unwrap_or_default();
            if row.is_complete(live) {
                complete.push(row.txid);
            } else {
                broken.push(row.txid);
            }
        }
        Ok((complete, broken))
    }

    // ─── Timeout ──────────────────────────────────────────────────────────────

    /// Hide unconfirmed transactions older than the retention window.
    pub async fn timeout_sweep(&self, now: i64) -> Result<SweepReport, IndexerError> {
        let cutoff = now - self.retention_secs;
        let mut report = SweepReport::default();
        let mut cursor = 0;
        loop {
            let page = self
                .store
                .unconfirmed_before(cutoff, cursor, self.sweep_page)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = last.cursor_id;
            let short = page.len() < self.sweep_page;
            report.scanned += page.len();

            let txids: Vec<String> = page.into_iter().map(|r| r.txid).collect();
            self.store.soft_delete_txs(&txids).await?;
            report.deleted += txids.len();
            if short {
                break;
            }
        }
        if report.deleted > 0 {
            tracing::info!(deleted = report.deleted, cutoff, "expired mempool transactions hidden");
        }
        Ok(report)
    }

    // ─── Mempool sync ─────────────────────────────────────────────────────────

    /// Compare the node's mempool with the index and ingest whatever is
    /// missing or inconsistent.
    pub async fn sync_mempool(&self) -> Result<MempoolSyncReport, IndexerError> {
        let mempool = self.node.raw_mempool().await?;
        let mut report = MempoolSyncReport {
            in_mempool: mempool.len(),
            ..Default::default()
        };

        let mut work: Vec<(String, IngestMode)> = Vec::new();
        for chunk in mempool.chunks(LOOKUP_CHUNK) {
            let rows = self.store.active_txs(chunk).await?;
            let counts = self.store.child_counts(chunk).await?;
            let mut seen = HashSet::new();
            for row in rows {
                seen.insert(row.txid.clone());
                let live = counts.get(&row.txid).copied().unwrap_or_default();
                if !row.is_complete(live) {
                    report.inconsistent += 1;
                    work.push((row.txid, IngestMode::Overwrite));
                }
            }
            for txid in chunk.iter().filter(|t| !seen.contains(*t)) {
                report.missing += 1;
                work.push((txid.clone(), IngestMode::SkipExisting));
            }
        }

        let results: Vec<Result<Option<String>, IndexerError>> = stream::iter(work)
            .map(|(txid, mode)| async move {
                let result = self.indexer.ingest_txid(&txid, mode).await;
                if let Err(e) = &result {
                    tracing::debug!(%txid, error = %e, "mempool sync fetch failed");
                }
                result
            })
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await;
        for result in results {
            match result {
                Ok(Some(_)) => report.ingested += 1,
                Ok(None) => {}
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!(
            in_mempool = report.in_mempool,
            missing = report.missing,
            inconsistent = report.inconsistent,
            ingested = report.ingested,
            failed = report.failed,
            "mempool sync"
        );
        Ok(report)
    }

    // ─── Blocks ───────────────────────────────────────────────────────────────

    /// Recount a few completed blocks. Consistent blocks move to
    /// `DoubleCheck`; the rest go back to `NoStart` for a full reprocess.
    pub async fn double_check_blocks(&self) -> Result<DoubleCheckReport, IndexerError> {
        let blocks = self
            .store
            .blocks_by_cursor(ProcessStatus::Completed, None, self.double_check_batch)
            .await?;
        let mut report = DoubleCheckReport::default();
        for block in blocks {
            let totals = self.store.block_totals(&block.hash).await?;
            if totals.is_consistent(block.num_tx) {
                let status = block.process_status.transition(ProcessStatus::DoubleCheck)?;
                self.store.mark_block_txs_checked(&block.hash).await?;
                self.store.set_block_status(&block.hash, status, None).await?;
                report.verified += 1;
            } else {
                tracing::warn!(
                    block = %block.hash,
                    height = block.height,
                    num_tx = block.num_tx,
                    tx_rows = totals.tx_rows,
                    "block failed double-check, reprocessing"
                );
                self.store
                    .set_block_status(&block.hash, ProcessStatus::NoStart, Some(0))
                    .await?;
                report.reset += 1;
            }
        }
        Ok(report)
    }

    // ─── Spends ───────────────────────────────────────────────────────────────

    /// Propagate spend flags both ways between inputs and outputs.
    pub async fn repair_spend_flags(&self) -> Result<(u64, u64), IndexerError> {
        let (outputs, inputs) = self.store.repair_spend_flags().await?;
        if outputs > 0 || inputs > 0 {
            tracing::info!(outputs, inputs, "spend flags repaired");
        }
        Ok((outputs, inputs))
    }

    // ─── Progress ─────────────────────────────────────────────────────────────

    pub async fn report_progress(&self) -> Result<SyncProgress, IndexerError> {
        let progress = self.store.progress().await?;
        let mempool = match self.node.mempool_info().await {
            Ok(info) => Some(info.size),
            Err(e) => {
                tracing::debug!(error = %e, "mempool info unavailable");
                None
            }
        };
        tracing::info!(
            total_blocks = progress.total_blocks,
            verified_blocks = progress.verified_blocks,
            verified_percent = %format!("{:.2}", progress.verified_percent()),
            unprocessed_inputs = progress.unprocessed_inputs,
            block_queue = self.indexer.block_queue().len(),
            mempool_queue = self.indexer.mempool_queue().len(),
            mempool_size = ?mempool,
            "sync progress"
        );
        Ok(progress)
    }
}
