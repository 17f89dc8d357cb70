//! Persisted-state contract shared by every pipeline component.
//!
//! Writes are keyed upserts or conditional updates; nothing here requires a
//! transaction spanning several calls. "Active" means `is_deleted = false`
//! for transaction rows and `is_reorg = false` for blocks.
//!
//! Upsert rules every backend must honour:
//! - a re-saved block keeps its `cursor_id`, `process_status` and
//!   `process_count`;
//! - a re-written transaction keeps `cursor_id`, `created_at` and
//!   `notify_status`, and a null `block_hash` only clears a stored one
//!   when the row was deleted or its block is reorged;
//! - a re-written input keeps `is_processed`, a re-written output keeps
//!   `is_used` and `check_token`;
//! - every upsert clears `is_deleted`.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{
    BlockFlags, BlockRecord, BlockTotals, ChildCounts, FtRecord, NftRecord, ProcessStatus,
    SyncProgress, TokenCheck, TxInRecord, TxOutRecord, TxRecord,
};

#[async_trait]
pub trait IndexStore: Send + Sync {
    // ─── Blocks ───────────────────────────────────────────────────────────────

    /// The block flagged `is_chaintips` with the highest cursor.
    async fn chain_tip(&self) -> Result<Option<BlockRecord>, IndexerError>;

    /// The block flagged `is_tail`, or failing that one without a parent.
    async fn tail(&self) -> Result<Option<BlockRecord>, IndexerError>;

    async fn block(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError>;

    /// The non-reorged block whose parent is `hash`.
    async fn active_successor(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError>;

    /// Insert new headers, or refresh header fields and flags of stored ones.
    async fn save_blocks(&self, blocks: &[BlockRecord]) -> Result<(), IndexerError>;

    async fn set_block_flags(&self, flags: &[BlockFlags]) -> Result<(), IndexerError>;

    /// Set the status, and the processed count when given.
    async fn set_block_status(
        &self,
        hash: &str,
        status: ProcessStatus,
        process_count: Option<u64>,
    ) -> Result<(), IndexerError>;

    async fn count_blocks(&self, status: ProcessStatus) -> Result<u64, IndexerError>;

    /// Active blocks in any of `statuses`, lowest height first.
    async fn blocks_by_height(
        &self,
        statuses: &[ProcessStatus],
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError>;

    /// Active blocks in `status`, lowest cursor first, optionally only those
    /// with `cursor_id < before_cursor`.
    async fn blocks_by_cursor(
        &self,
        status: ProcessStatus,
        before_cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError>;

    async fn max_block_cursor(&self, status: ProcessStatus) -> Result<Option<i64>, IndexerError>;

    /// Active `Completed` blocks whose `process_count != num_tx`.
    async fn incomplete_completed_blocks(
        &self,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError>;

    /// Reset every `Completed` block to `NoStart`. Returns rows changed.
    async fn recycle_completed(&self) -> Result<u64, IndexerError>;

    async fn block_totals(&self, hash: &str) -> Result<BlockTotals, IndexerError>;

    async fn progress(&self) -> Result<SyncProgress, IndexerError>;

    // ─── Transactions ─────────────────────────────────────────────────────────

    async fn active_txs(&self, txids: &[String]) -> Result<Vec<TxRecord>, IndexerError>;

    /// Live input/output counts per txid. Txids without rows are absent.
    async fn child_counts(
        &self,
        txids: &[String],
    ) -> Result<HashMap<String, ChildCounts>, IndexerError>;

    async fn upsert_txs(&self, txs: &[TxRecord]) -> Result<(), IndexerError>;
    async fn upsert_tx_ins(&self, ins: &[TxInRecord]) -> Result<(), IndexerError>;
    async fn upsert_tx_outs(&self, outs: &[TxOutRecord]) -> Result<(), IndexerError>;
    async fn upsert_fts(&self, fts: &[FtRecord]) -> Result<(), IndexerError>;
    async fn upsert_nfts(&self, nfts: &[NftRecord]) -> Result<(), IndexerError>;

    /// Clear `is_deleted` on the transactions and their inputs/outputs.
    async fn restore_txs(&self, txids: &[String]) -> Result<(), IndexerError>;

    /// Set `is_deleted` on the transactions and their inputs/outputs.
    async fn soft_delete_txs(&self, txids: &[String]) -> Result<(), IndexerError>;

    async fn mark_completed_check(&self, txids: &[String]) -> Result<(), IndexerError>;

    /// Set `is_completed_check` on every active transaction of a block.
    async fn mark_block_txs_checked(&self, block_hash: &str) -> Result<(), IndexerError>;

    /// Set or clear `is_deleted` on all transactions (and children) attached
    /// to the given blocks. Returns transaction rows changed.
    async fn set_block_txs_deleted(
        &self,
        block_hashes: &[String],
        deleted: bool,
    ) -> Result<u64, IndexerError>;

    /// Physically remove coinbase transactions of the given blocks together
    /// with their outputs and token rows. Returns the removed txids.
    async fn purge_coinbase_txs(
        &self,
        block_hashes: &[String],
    ) -> Result<Vec<String>, IndexerError>;

    /// Unconfirmed, active, not yet checked transactions after `after_cursor`.
    async fn unconfirmed_unchecked(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError>;

    /// Unconfirmed, active transactions created before `created_before`.
    async fn unconfirmed_before(
        &self,
        created_before: i64,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError>;

    // ─── Spends ───────────────────────────────────────────────────────────────

    /// Lowest cursor of an active, unprocessed input at or after `from_cursor`.
    async fn first_unprocessed_input(&self, from_cursor: i64)
        -> Result<Option<i64>, IndexerError>;

    /// For inputs with `from <= cursor_id < to` whose spent output exists,
    /// set `TxIn.is_processed` and `TxOut.is_used`. Returns inputs marked.
    async fn mark_spent_window(&self, from: i64, to: i64) -> Result<u64, IndexerError>;

    /// Propagate spend flags in both directions. Returns
    /// `(outputs_marked_used, inputs_marked_processed)`.
    async fn repair_spend_flags(&self) -> Result<(u64, u64), IndexerError>;

    // ─── Tokens ───────────────────────────────────────────────────────────────

    /// Active `Uncheck` fungible-token outputs after `after_cursor`, lowest
    /// cursor first, joined with their token rows.
    async fn unchecked_ft_outputs(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<(TxOutRecord, FtRecord)>, IndexerError>;

    /// Active inputs of a transaction.
    async fn tx_ins_of(&self, txid: &str) -> Result<Vec<TxInRecord>, IndexerError>;

    async fn ft_outputs(&self, outpoints: &[String]) -> Result<Vec<FtRecord>, IndexerError>;

    async fn ft_outputs_of_tx(&self, txid: &str) -> Result<Vec<FtRecord>, IndexerError>;

    /// The active input spending `outpoint`.
    async fn spender(&self, outpoint: &str) -> Result<Option<TxInRecord>, IndexerError>;

    async fn set_token_checks(&self, checks: &[(String, TokenCheck)]) -> Result<(), IndexerError>;
}
