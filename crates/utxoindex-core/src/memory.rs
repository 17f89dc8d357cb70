//! In-memory `IndexStore`.
//!
//! Holds every table behind one mutex, so each trait call is atomic. Useful
//! for tests and short-lived indexers that don't need persistence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::store::IndexStore;
use crate::types::{
    BlockFlags, BlockRecord, BlockTotals, ChildCounts, FtRecord, NftRecord, ProcessStatus,
    ScriptType, SyncProgress, TokenCheck, TxInRecord, TxOutRecord, TxRecord,
};

#[derive(Default)]
struct Tables {
    blocks: HashMap<String, BlockRecord>,
    txs: HashMap<String, TxRecord>,
    tx_ins: HashMap<String, TxInRecord>,
    tx_outs: HashMap<String, TxOutRecord>,
    fts: HashMap<String, FtRecord>,
    nfts: HashMap<String, NftRecord>,
    block_seq: i64,
    tx_seq: i64,
    in_seq: i64,
    out_seq: i64,
}

impl Tables {
    fn children_deleted(&mut self, txids: &HashSet<&str>, deleted: bool) {
        for row in self.tx_ins.values_mut() {
            if txids.contains(row.txid.as_str()) {
                row.is_deleted = deleted;
            }
        }
        for row in self.tx_outs.values_mut() {
            if txids.contains(row.txid.as_str()) {
                row.is_deleted = deleted;
            }
        }
    }

    fn active_blocks(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values().filter(|b| !b.is_reorg)
    }
}

/// In-memory index store. All data is lost when it is dropped.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<(), IndexerError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(IndexerError::Storage("writes disabled".into()));
        }
        Ok(())
    }

    /// Make every upsert fail until switched back. Used to exercise
    /// batch requeue paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    pub fn tx(&self, txid: &str) -> Option<TxRecord> {
        self.tables().txs.get(txid).cloned()
    }

    pub fn tx_in(&self, outpoint: &str) -> Option<TxInRecord> {
        self.tables().tx_ins.get(outpoint).cloned()
    }

    pub fn tx_out(&self, outpoint: &str) -> Option<TxOutRecord> {
        self.tables().tx_outs.get(outpoint).cloned()
    }

    pub fn ft(&self, outpoint: &str) -> Option<FtRecord> {
        self.tables().fts.get(outpoint).cloned()
    }

    pub fn nft(&self, outpoint: &str) -> Option<NftRecord> {
        self.tables().nfts.get(outpoint).cloned()
    }

    /// All blocks, lowest height first.
    pub fn blocks(&self) -> Vec<BlockRecord> {
        let mut blocks: Vec<_> = self.tables().blocks.values().cloned().collect();
        blocks.sort_by_key(|b| (b.height, b.cursor_id));
        blocks
    }

    /// `(transactions, inputs, outputs)` row counts, deleted rows included.
    pub fn row_counts(&self) -> (usize, usize, usize) {
        let t = self.tables();
        (t.txs.len(), t.tx_ins.len(), t.tx_outs.len())
    }
}

fn sorted_by_cursor<T: Clone>(mut rows: Vec<&T>, key: impl Fn(&T) -> i64, limit: usize) -> Vec<T> {
    rows.sort_by_key(|r| key(r));
    rows.into_iter().take(limit).cloned().collect()
}

#[async_trait]
impl IndexStore for MemoryStore {
    // ─── Blocks ───────────────────────────────────────────────────────────────

    async fn chain_tip(&self) -> Result<Option<BlockRecord>, IndexerError> {
        Ok(self
            .tables()
            .blocks
            .values()
            .filter(|b| b.is_chaintips)
            .max_by_key(|b| b.cursor_id)
            .cloned())
    }

    async fn tail(&self) -> Result<Option<BlockRecord>, IndexerError> {
        let t = self.tables();
        let flagged = t.blocks.values().filter(|b| b.is_tail).max_by_key(|b| b.cursor_id);
        Ok(flagged
            .or_else(|| t.blocks.values().find(|b| b.prev_hash.is_none()))
            .cloned())
    }

    async fn block(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError> {
        Ok(self.tables().blocks.get(hash).cloned())
    }

    async fn active_successor(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError> {
        Ok(self
            .tables()
            .active_blocks()
            .filter(|b| b.prev_hash.as_deref() == Some(hash))
            .max_by_key(|b| b.cursor_id)
            .cloned())
    }

    async fn save_blocks(&self, blocks: &[BlockRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for block in blocks {
            match t.blocks.get(&block.hash) {
                Some(existing) => {
                    let mut row = block.clone();
                    row.cursor_id = existing.cursor_id;
                    row.process_status = existing.process_status;
                    row.process_count = existing.process_count;
                    t.blocks.insert(row.hash.clone(), row);
                }
                None => {
                    t.block_seq += 1;
                    let mut row = block.clone();
                    row.cursor_id = t.block_seq;
                    t.blocks.insert(row.hash.clone(), row);
                }
            }
        }
        Ok(())
    }

    async fn set_block_flags(&self, flags: &[BlockFlags]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for f in flags {
            if let Some(row) = t.blocks.get_mut(&f.hash) {
                row.is_chaintips = f.is_chaintips;
                row.is_tail = f.is_tail;
                row.is_reorg = f.is_reorg;
                if f.reset_status {
                    row.process_status = ProcessStatus::NoStart;
                    row.process_count = 0;
                }
            }
        }
        Ok(())
    }

    async fn set_block_status(
        &self,
        hash: &str,
        status: ProcessStatus,
        process_count: Option<u64>,
    ) -> Result<(), IndexerError> {
        self.check_writable()?;
        if let Some(row) = self.tables().blocks.get_mut(hash) {
            row.process_status = status;
            if let Some(count) = process_count {
                row.process_count = count;
            }
        }
        Ok(())
    }

    async fn count_blocks(&self, status: ProcessStatus) -> Result<u64, IndexerError> {
        Ok(self
            .tables()
            .active_blocks()
            .filter(|b| b.process_status == status)
            .count() as u64)
    }

    async fn blocks_by_height(
        &self,
        statuses: &[ProcessStatus],
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .active_blocks()
            .filter(|b| statuses.contains(&b.process_status))
            .collect();
        rows.sort_by_key(|b| (b.height, b.cursor_id));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn blocks_by_cursor(
        &self,
        status: ProcessStatus,
        before_cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        let t = self.tables();
        let rows = t
            .active_blocks()
            .filter(|b| b.process_status == status)
            .filter(|b| before_cursor.map_or(true, |c| b.cursor_id < c))
            .collect();
        Ok(sorted_by_cursor(rows, |b| b.cursor_id, limit))
    }

    async fn max_block_cursor(&self, status: ProcessStatus) -> Result<Option<i64>, IndexerError> {
        Ok(self
            .tables()
            .active_blocks()
            .filter(|b| b.process_status == status)
            .map(|b| b.cursor_id)
            .max())
    }

    async fn incomplete_completed_blocks(
        &self,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        let t = self.tables();
        let rows = t
            .active_blocks()
            .filter(|b| b.process_status == ProcessStatus::Completed)
            .filter(|b| b.num_tx != b.process_count)
            .collect();
        Ok(sorted_by_cursor(rows, |b| b.cursor_id, limit))
    }

    async fn recycle_completed(&self) -> Result<u64, IndexerError> {
        self.check_writable()?;
        let mut changed = 0;
        for row in self.tables().blocks.values_mut() {
            if row.process_status == ProcessStatus::Completed {
                row.process_status = ProcessStatus::NoStart;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn block_totals(&self, hash: &str) -> Result<BlockTotals, IndexerError> {
        let t = self.tables();
        let mut totals = BlockTotals::default();
        let mut txids = HashSet::new();
        for tx in t.txs.values() {
            if tx.is_deleted || tx.block_hash.as_deref() != Some(hash) {
                continue;
            }
            totals.tx_rows += 1;
            totals.declared_inputs += u64::from(tx.tx_in_num);
            totals.coinbase_inputs += u64::from(tx.tx_in_coinbase);
            totals.declared_outputs += u64::from(tx.tx_out_num);
            totals.zero_value_outputs += u64::from(tx.tx_out_zero_value);
            txids.insert(tx.txid.as_str());
        }
        totals.indexed_inputs = t
            .tx_ins
            .values()
            .filter(|r| !r.is_deleted && txids.contains(r.txid.as_str()))
            .count() as u64;
        totals.indexed_outputs = t
            .tx_outs
            .values()
            .filter(|r| !r.is_deleted && txids.contains(r.txid.as_str()))
            .count() as u64;
        Ok(totals)
    }

    async fn progress(&self) -> Result<SyncProgress, IndexerError> {
        let t = self.tables();
        Ok(SyncProgress {
            total_blocks: t.active_blocks().count() as u64,
            verified_blocks: t
                .active_blocks()
                .filter(|b| b.process_status == ProcessStatus::DoubleCheck)
                .count() as u64,
            unprocessed_inputs: t
                .tx_ins
                .values()
                .filter(|r| !r.is_deleted && !r.is_processed)
                .count() as u64,
        })
    }

    // ─── Transactions ─────────────────────────────────────────────────────────

    async fn active_txs(&self, txids: &[String]) -> Result<Vec<TxRecord>, IndexerError> {
        let t = self.tables();
        Ok(txids
            .iter()
            .filter_map(|id| t.txs.get(id))
            .filter(|tx| !tx.is_deleted)
            .cloned()
            .collect())
    }

    async fn child_counts(
        &self,
        txids: &[String],
    ) -> Result<HashMap<String, ChildCounts>, IndexerError> {
        let t = self.tables();
        let wanted: HashSet<&str> = txids.iter().map(String::as_str).collect();
        let mut counts: HashMap<String, ChildCounts> = HashMap::new();
        for row in t.tx_ins.values() {
            if !row.is_deleted && wanted.contains(row.txid.as_str()) {
                counts.entry(row.txid.clone()).or_default().inputs += 1;
            }
        }
        for row in t.tx_outs.values() {
            if !row.is_deleted && wanted.contains(row.txid.as_str()) {
                counts.entry(row.txid.clone()).or_default().outputs += 1;
            }
        }
        Ok(counts)
    }

    async fn upsert_txs(&self, txs: &[TxRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for tx in txs {
            let mut row = tx.clone();
            row.is_deleted = false;
            match t.txs.get(&tx.txid) {
                Some(existing) => {
                    row.cursor_id = existing.cursor_id;
                    row.created_at = existing.created_at;
                    row.notify_status = existing.notify_status;
                    // a hidden row or one from a reorged block re-enters as mempool
                    let stale = existing.is_deleted
                        || existing
                            .block_hash
                            .as_ref()
                            .and_then(|hash| t.blocks.get(hash))
                            .is_some_and(|block| block.is_reorg);
                    if row.block_hash.is_none() && !stale {
                        row.block_hash = existing.block_hash.clone();
                    }
                }
                None => {
                    t.tx_seq += 1;
                    row.cursor_id = t.tx_seq;
                }
            }
            t.txs.insert(row.txid.clone(), row);
        }
        Ok(())
    }

    async fn upsert_tx_ins(&self, ins: &[TxInRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for input in ins {
            let mut row = input.clone();
            row.is_deleted = false;
            match t.tx_ins.get(&input.outpoint) {
                Some(existing) => {
                    row.cursor_id = existing.cursor_id;
                    row.is_processed = existing.is_processed;
                }
                None => {
                    t.in_seq += 1;
                    row.cursor_id = t.in_seq;
                }
            }
            t.tx_ins.insert(row.outpoint.clone(), row);
        }
        Ok(())
    }

    async fn upsert_tx_outs(&self, outs: &[TxOutRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for output in outs {
            let mut row = output.clone();
            row.is_deleted = false;
            match t.tx_outs.get(&output.outpoint) {
                Some(existing) => {
                    row.cursor_id = existing.cursor_id;
                    row.is_used = existing.is_used;
                    row.check_token = existing.check_token;
                }
                None => {
                    t.out_seq += 1;
                    row.cursor_id = t.out_seq;
                }
            }
            t.tx_outs.insert(row.outpoint.clone(), row);
        }
        Ok(())
    }

    async fn upsert_fts(&self, fts: &[FtRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for ft in fts {
            t.fts.insert(ft.outpoint.clone(), ft.clone());
        }
        Ok(())
    }

    async fn upsert_nfts(&self, nfts: &[NftRecord]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for nft in nfts {
            t.nfts.insert(nft.outpoint.clone(), nft.clone());
        }
        Ok(())
    }

    async fn restore_txs(&self, txids: &[String]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let set: HashSet<&str> = txids.iter().map(String::as_str).collect();
        for id in &set {
            if let Some(tx) = t.txs.get_mut(*id) {
                tx.is_deleted = false;
            }
        }
        t.children_deleted(&set, false);
        Ok(())
    }

    async fn soft_delete_txs(&self, txids: &[String]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let set: HashSet<&str> = txids.iter().map(String::as_str).collect();
        for id in &set {
            if let Some(tx) = t.txs.get_mut(*id) {
                tx.is_deleted = true;
            }
        }
        t.children_deleted(&set, true);
        Ok(())
    }

    async fn mark_completed_check(&self, txids: &[String]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for id in txids {
            if let Some(tx) = t.txs.get_mut(id) {
                tx.is_completed_check = true;
            }
        }
        Ok(())
    }

    async fn mark_block_txs_checked(&self, block_hash: &str) -> Result<(), IndexerError> {
        self.check_writable()?;
        for tx in self.tables().txs.values_mut() {
            if !tx.is_deleted && tx.block_hash.as_deref() == Some(block_hash) {
                tx.is_completed_check = true;
            }
        }
        Ok(())
    }

    async fn set_block_txs_deleted(
        &self,
        block_hashes: &[String],
        deleted: bool,
    ) -> Result<u64, IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let blocks: HashSet<&str> = block_hashes.iter().map(String::as_str).collect();
        let mut txids = Vec::new();
        for tx in t.txs.values_mut() {
            let attached = tx.block_hash.as_deref().is_some_and(|h| blocks.contains(h));
            if attached && tx.is_deleted != deleted {
                tx.is_deleted = deleted;
                txids.push(tx.txid.clone());
            }
        }
        let set: HashSet<&str> = txids.iter().map(String::as_str).collect();
        t.children_deleted(&set, deleted);
        Ok(txids.len() as u64)
    }

    async fn purge_coinbase_txs(
        &self,
        block_hashes: &[String],
    ) -> Result<Vec<String>, IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let blocks: HashSet<&str> = block_hashes.iter().map(String::as_str).collect();
        let txids: Vec<String> = t
            .txs
            .values()
            .filter(|tx| tx.tx_in_coinbase == 1)
            .filter(|tx| tx.block_hash.as_deref().is_some_and(|h| blocks.contains(h)))
            .map(|tx| tx.txid.clone())
            .collect();
        let set: HashSet<&str> = txids.iter().map(String::as_str).collect();
        t.txs.retain(|id, _| !set.contains(id.as_str()));
        t.tx_outs.retain(|_, row| !set.contains(row.txid.as_str()));
        t.fts.retain(|_, row| !set.contains(row.txid.as_str()));
        t.nfts.retain(|_, row| !set.contains(row.txid.as_str()));
        Ok(txids)
    }

    async fn unconfirmed_unchecked(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let t = self.tables();
        let rows = t
            .txs
            .values()
            .filter(|tx| tx.block_hash.is_none() && !tx.is_deleted && !tx.is_completed_check)
            .filter(|tx| tx.cursor_id > after_cursor)
            .collect();
        Ok(sorted_by_cursor(rows, |tx| tx.cursor_id, limit))
    }

    async fn unconfirmed_before(
        &self,
        created_before: i64,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let t = self.tables();
        let rows = t
            .txs
            .values()
            .filter(|tx| tx.block_hash.is_none() && !tx.is_deleted)
            .filter(|tx| tx.created_at < created_before && tx.cursor_id > after_cursor)
            .collect();
        Ok(sorted_by_cursor(rows, |tx| tx.cursor_id, limit))
    }

    // ─── Spends ───────────────────────────────────────────────────────────────

    async fn first_unprocessed_input(
        &self,
        from_cursor: i64,
    ) -> Result<Option<i64>, IndexerError> {
        Ok(self
            .tables()
            .tx_ins
            .values()
            .filter(|r| !r.is_deleted && !r.is_processed && r.cursor_id >= from_cursor)
            .map(|r| r.cursor_id)
            .min())
    }

    async fn mark_spent_window(&self, from: i64, to: i64) -> Result<u64, IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let candidates: Vec<String> = t
            .tx_ins
            .values()
            .filter(|r| !r.is_deleted && !r.is_processed)
            .filter(|r| r.cursor_id >= from && r.cursor_id < to)
            .map(|r| r.outpoint.clone())
            .collect();
        let mut marked = 0;
        for outpoint in candidates {
            let Some(output) = t.tx_outs.get_mut(&outpoint) else {
                continue;
            };
            output.is_used = true;
            if let Some(input) = t.tx_ins.get_mut(&outpoint) {
                input.is_processed = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn repair_spend_flags(&self) -> Result<(u64, u64), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        let processed: Vec<String> = t
            .tx_ins
            .values()
            .filter(|r| r.is_processed && !r.is_deleted)
            .map(|r| r.outpoint.clone())
            .collect();
        let mut used = 0;
        for outpoint in processed {
            if let Some(output) = t.tx_outs.get_mut(&outpoint) {
                if !output.is_used {
                    output.is_used = true;
                    used += 1;
                }
            }
        }
        let spent: Vec<String> = t
            .tx_outs
            .values()
            .filter(|r| r.is_used)
            .map(|r| r.outpoint.clone())
            .collect();
        let mut inputs = 0;
        for outpoint in spent {
            if let Some(input) = t.tx_ins.get_mut(&outpoint) {
                if !input.is_processed {
                    input.is_processed = true;
                    inputs += 1;
                }
            }
        }
        Ok((used, inputs))
    }

    // ─── Tokens ───────────────────────────────────────────────────────────────

    async fn unchecked_ft_outputs(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<(TxOutRecord, FtRecord)>, IndexerError> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .tx_outs
            .values()
            .filter(|o| o.script_type == ScriptType::FungibleToken)
            .filter(|o| o.check_token == TokenCheck::Uncheck && !o.is_deleted)
            .filter(|o| o.cursor_id > after_cursor)
            .filter_map(|o| t.fts.get(&o.outpoint).map(|ft| (o, ft)))
            .collect();
        rows.sort_by_key(|(o, _)| o.cursor_id);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(o, ft)| (o.clone(), ft.clone()))
            .collect())
    }

    async fn tx_ins_of(&self, txid: &str) -> Result<Vec<TxInRecord>, IndexerError> {
        let t = self.tables();
        let mut rows: Vec<_> = t
            .tx_ins
            .values()
            .filter(|r| r.txid == txid && !r.is_deleted)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.input_index);
        Ok(rows)
    }

    async fn ft_outputs(&self, outpoints: &[String]) -> Result<Vec<FtRecord>, IndexerError> {
        let t = self.tables();
        Ok(outpoints.iter().filter_map(|o| t.fts.get(o)).cloned().collect())
    }

    async fn ft_outputs_of_tx(&self, txid: &str) -> Result<Vec<FtRecord>, IndexerError> {
        let t = self.tables();
        let mut rows: Vec<_> = t.fts.values().filter(|f| f.txid == txid).cloned().collect();
        rows.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        Ok(rows)
    }

    async fn spender(&self, outpoint: &str) -> Result<Option<TxInRecord>, IndexerError> {
        Ok(self
            .tables()
            .tx_ins
            .get(outpoint)
            .filter(|r| !r.is_deleted)
            .cloned())
    }

    async fn set_token_checks(&self, checks: &[(String, TokenCheck)]) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut t = self.tables();
        for (outpoint, check) in checks {
            if let Some(row) = t.tx_outs.get_mut(outpoint) {
                row.check_token = *check;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotifyStatus;

    fn tx(txid: &str, block: Option<&str>) -> TxRecord {
        TxRecord {
            txid: txid.into(),
            block_hash: block.map(Into::into),
            tx_in_num: 1,
            tx_in_coinbase: 0,
            tx_out_num: 1,
            tx_out_zero_value: 0,
            is_completed_check: false,
            is_deleted: false,
            notify_status: NotifyStatus::NoStart,
            cursor_id: 0,
            created_at: 100,
        }
    }

    fn input(outpoint: &str, txid: &str) -> TxInRecord {
        TxInRecord {
            outpoint: outpoint.into(),
            txid: txid.into(),
            input_index: 0,
            is_processed: false,
            is_deleted: false,
            cursor_id: 0,
        }
    }

    fn output(outpoint: &str, txid: &str) -> TxOutRecord {
        TxOutRecord {
            outpoint: outpoint.into(),
            txid: txid.into(),
            output_index: 0,
            script_type: ScriptType::P2pkh,
            address_hex: "aa".into(),
            satoshis: 10,
            check_token: TokenCheck::Uncheck,
            is_used: false,
            is_deleted: false,
            cursor_id: 0,
        }
    }

    #[tokio::test]
    async fn tx_upsert_keeps_cursor_and_block_hash() {
        let store = MemoryStore::new();
        store.upsert_txs(&[tx("a", Some("blk"))]).await.unwrap();
        let first = store.tx("a").unwrap();

        let mut again = tx("a", None);
        again.created_at = 999;
        store.upsert_txs(&[again]).await.unwrap();

        let row = store.tx("a").unwrap();
        assert_eq!(row.cursor_id, first.cursor_id);
        assert_eq!(row.created_at, 100);
        assert_eq!(row.block_hash.as_deref(), Some("blk"));
        assert_eq!(store.row_counts().0, 1);
    }

    #[tokio::test]
    async fn spend_window_marks_both_sides() {
        let store = MemoryStore::new();
        store.upsert_tx_outs(&[output("p_0", "p")]).await.unwrap();
        store
            .upsert_tx_ins(&[input("p_0", "c"), input("missing_0", "c")])
            .await
            .unwrap();

        let first = store.first_unprocessed_input(0).await.unwrap().unwrap();
        let marked = store.mark_spent_window(first, first + 10).await.unwrap();
        assert_eq!(marked, 1);
        assert!(store.tx_out("p_0").unwrap().is_used);
        assert!(store.tx_in("p_0").unwrap().is_processed);
        assert!(!store.tx_in("missing_0").unwrap().is_processed);

        // A re-written input keeps its processed flag.
        store.upsert_tx_ins(&[input("p_0", "c")]).await.unwrap();
        assert!(store.tx_in("p_0").unwrap().is_processed);
    }

    #[tokio::test]
    async fn repair_propagates_flags() {
        let store = MemoryStore::new();
        let mut used = output("x_0", "x");
        used.is_used = true;
        let mut processed = input("y_0", "d");
        processed.is_processed = true;
        store.upsert_tx_outs(&[used, output("y_0", "y")]).await.unwrap();
        store.upsert_tx_ins(&[input("x_0", "c"), processed]).await.unwrap();

        let (outs, ins) = store.repair_spend_flags().await.unwrap();
        assert_eq!((outs, ins), (1, 1));
        assert!(store.tx_out("y_0").unwrap().is_used);
        assert!(store.tx_in("x_0").unwrap().is_processed);
        assert_eq!(store.repair_spend_flags().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn soft_delete_and_restore_children() {
        let store = MemoryStore::new();
        store.upsert_txs(&[tx("a", None)]).await.unwrap();
        store.upsert_tx_outs(&[output("a_0", "a")]).await.unwrap();
        store.soft_delete_txs(&["a".into()]).await.unwrap();
        assert!(store.active_txs(&["a".into()]).await.unwrap().is_empty());
        assert!(store.tx_out("a_0").unwrap().is_deleted);

        store.restore_txs(&["a".into()]).await.unwrap();
        assert_eq!(store.active_txs(&["a".into()]).await.unwrap().len(), 1);
        let counts = store.child_counts(&["a".into()]).await.unwrap();
        assert_eq!(counts["a"].outputs, 1);
    }

    #[tokio::test]
    async fn purge_removes_coinbase_rows() {
        let store = MemoryStore::new();
        let mut cb = tx("cb", Some("blk"));
        cb.tx_in_coinbase = 1;
        store.upsert_txs(&[cb, tx("n", Some("blk"))]).await.unwrap();
        store.upsert_tx_outs(&[output("cb_0", "cb")]).await.unwrap();

        let purged = store.purge_coinbase_txs(&["blk".into()]).await.unwrap();
        assert_eq!(purged, vec!["cb".to_string()]);
        assert!(store.tx("cb").is_none());
        assert!(store.tx_out("cb_0").is_none());
        assert!(store.tx("n").is_some());
    }

    #[tokio::test]
    async fn failing_writes_surface_storage_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.upsert_txs(&[tx("a", None)]).await.unwrap_err();
        assert!(err.is_transient());
        store.set_fail_writes(false);
        store.upsert_txs(&[tx("a", None)]).await.unwrap();
    }
}
