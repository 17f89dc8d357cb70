//! Transaction/UTXO indexer.
//!
//! Two write paths share one decoder:
//! - **mempool**: one transaction at a time, skipped when an active row
//!   already exists unless [`IngestMode::Overwrite`] is requested;
//! - **block**: work items queued by the decomposer are decoded into a batch
//!   and flushed with chunked, concurrent upserts. A batch that hits any
//!   write error is requeued whole; a clean batch completes every block
//!   whose last item it carried.
//!
//! Child rows are always written before transaction rows, so a visible
//! transaction row means its inputs and outputs were written.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::cache::BlockCache;
use crate::codec::Transaction;
use crate::config::IndexerConfig;
use crate::error::IndexerError;
use crate::handler::{CompletedBlock, HandlerRegistry, IndexedTx};
use crate::node::NodeClient;
use crate::queue::WorkQueue;
use crate::script::{classify, TokenData};
use crate::store::IndexStore;
use crate::types::{
    outpoint_key, FtRecord, NftRecord, NotifyStatus, ProcessStatus, TokenCheck, TxInRecord,
    TxOutRecord, TxRecord,
};

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// One block transaction waiting to be written.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub block_hash: String,
    pub block_height: u64,
    pub block_tx_count: u64,
    pub txid: String,
    pub tx: Transaction,
    /// Set on the final item emitted for a block.
    pub is_last: bool,
}

/// Rows derived from one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTx {
    pub tx: TxRecord,
    pub inputs: Vec<TxInRecord>,
    pub outputs: Vec<TxOutRecord>,
    pub fts: Vec<FtRecord>,
    pub nfts: Vec<NftRecord>,
}

/// Derive every row for `tx`. Coinbase inputs are counted, not stored;
/// zero-value outputs are counted, not stored.
pub fn decode_transaction(
    tx: &Transaction,
    txid: &str,
    block_hash: Option<&str>,
    now: i64,
) -> DecodedTx {
    let mut inputs = Vec::with_capacity(tx.inputs.len());
    let mut coinbase = 0u32;
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.is_coinbase() {
            coinbase += 1;
            continue;
        }
        inputs.push(TxInRecord {
            outpoint: outpoint_key(&input.prev_txid, input.prev_index),
            txid: txid.to_string(),
            input_index: i as u32,
            is_processed: false,
            is_deleted: false,
            cursor_id: 0,
        });
    }

    let mut outputs = Vec::with_capacity(tx.outputs.len());
    let mut fts = Vec::new();
    let mut nfts = Vec::new();
    let mut zero_value = 0u32;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value == 0 {
            zero_value += 1;
            continue;
        }
        let outpoint = outpoint_key(txid, i as u32);
        let info = classify(&output.script);
        match info.token {
            Some(TokenData::Ft(ft)) => fts.push(FtRecord {
                outpoint: outpoint.clone(),
                txid: txid.to_string(),
                code_hash: ft.code_hash,
                genesis: ft.genesis,
                name: ft.name,
                symbol: ft.symbol,
                sensible_id: ft.sensible_id,
                decimal: ft.decimal,
                amount: ft.amount.to_string(),
            }),
            Some(TokenData::Nft(nft)) => nfts.push(NftRecord {
                outpoint: outpoint.clone(),
                txid: txid.to_string(),
                code_hash: nft.code_hash,
                genesis: nft.genesis,
                sensible_id: nft.sensible_id,
                meta_txid: nft.meta_txid,
                meta_output_index: nft.meta_output_index,
                token_supply: nft.token_supply.to_string(),
                token_index: nft.token_index.to_string(),
            }),
            None => {}
        }
        outputs.push(TxOutRecord {
            outpoint,
            txid: txid.to_string(),
            output_index: i as u32,
            script_type: info.script_type,
            address_hex: info.address_hex,
            satoshis: output.value,
            check_token: TokenCheck::Uncheck,
            is_used: false,
            is_deleted: false,
            cursor_id: 0,
        });
    }

    DecodedTx {
        tx: TxRecord {
            txid: txid.to_string(),
            block_hash: block_hash.map(str::to_string),
            tx_in_num: tx.inputs.len() as u32,
            tx_in_coinbase: coinbase,
            tx_out_num: tx.outputs.len() as u32,
            tx_out_zero_value: zero_value,
            is_completed_check: false,
            is_deleted: false,
            notify_status: NotifyStatus::NoStart,
            cursor_id: 0,
            created_at: now,
        },
        inputs,
        outputs,
        fts,
        nfts,
    }
}

// ─── Writing ──────────────────────────────────────────────────────────────────

/// How the mempool path treats a transaction that already has an active row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    SkipExisting,
    Overwrite,
}

/// A chunk of rows for one upsert call.
enum RowChunk<'a> {
    Ins(&'a [TxInRecord]),
    Outs(&'a [TxOutRecord]),
    Fts(&'a [FtRecord]),
    Nfts(&'a [NftRecord]),
    Txs(&'a [TxRecord]),
}

#[derive(Default)]
struct BatchRows {
    txs: Vec<TxRecord>,
    ins: Vec<TxInRecord>,
    outs: Vec<TxOutRecord>,
    fts: Vec<FtRecord>,
    nfts: Vec<NftRecord>,
}

impl BatchRows {
    fn from_decoded(decoded: &[DecodedTx]) -> Self {
        let mut rows = Self::default();
        for d in decoded {
            rows.txs.push(d.tx.clone());
            rows.ins.extend(d.inputs.iter().cloned());
            rows.outs.extend(d.outputs.iter().cloned());
            rows.fts.extend(d.fts.iter().cloned());
            rows.nfts.extend(d.nfts.iter().cloned());
        }
        // Key order keeps concurrent upserts from contending on the same pages.
        rows.txs.sort_by(|a, b| a.txid.cmp(&b.txid));
        rows.ins.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        rows.outs.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        rows.fts.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        rows.nfts.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        rows
    }
}

// ─── TxIndexer ────────────────────────────────────────────────────────────────

pub struct TxIndexer {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    cache: Arc<BlockCache>,
    handlers: Arc<HandlerRegistry>,
    block_queue: WorkQueue<WorkItem>,
    mempool_queue: WorkQueue<Vec<u8>>,
    flush_input_threshold: usize,
    flush_chunk_large: usize,
    flush_chunk_small: usize,
    write_concurrency: usize,
    mempool_chunk: usize,
    mempool_write_concurrency: usize,
    spend_window: i64,
}

impl TxIndexer {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        cache: Arc<BlockCache>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            node,
            cache,
            handlers,
            block_queue: WorkQueue::new(config.tx_queue_max),
            mempool_queue: WorkQueue::new(config.tx_queue_max),
            flush_input_threshold: config.flush_input_threshold,
            flush_chunk_large: config.flush_chunk_large.max(1),
            flush_chunk_small: config.flush_chunk_small.max(1),
            write_concurrency: config.write_concurrency.max(1),
            mempool_chunk: config.mempool_chunk.max(1),
            mempool_write_concurrency: config.mempool_write_concurrency.max(1),
            spend_window: config.spend_window,
        }
    }

    pub fn block_queue(&self) -> &WorkQueue<WorkItem> {
        &self.block_queue
    }

    pub fn mempool_queue(&self) -> &WorkQueue<Vec<u8>> {
        &self.mempool_queue
    }

    async fn upsert(&self, chunk: RowChunk<'_>) -> Result<(), IndexerError> {
        match chunk {
            RowChunk::Ins(rows) => self.store.upsert_tx_ins(rows).await,
            RowChunk::Outs(rows) => self.store.upsert_tx_outs(rows).await,
            RowChunk::Fts(rows) => self.store.upsert_fts(rows).await,
            RowChunk::Nfts(rows) => self.store.upsert_nfts(rows).await,
            RowChunk::Txs(rows) => self.store.upsert_txs(rows).await,
        }
    }

    /// Run every chunk with bounded concurrency. All chunks are attempted;
    /// the first error is returned after they finish.
    async fn run_chunks(
        &self,
        chunks: Vec<RowChunk<'_>>,
        concurrency: usize,
    ) -> Result<(), IndexerError> {
        let pending: Vec<futures::future::BoxFuture<'_, Result<(), IndexerError>>> = chunks
            .into_iter()
            .map(|chunk| Box::pin(self.upsert(chunk)) as _)
            .collect();
        let results: Vec<Result<(), IndexerError>> = stream::iter(pending)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        match results.into_iter().find_map(Result::err) {
            Some(first) => {
                tracing::warn!(failures, error = %first, "row upserts failed");
                Err(first)
            }
            None => Ok(()),
        }
    }

    /// Children first, then transaction rows.
    async fn write_rows(
        &self,
        rows: &BatchRows,
        chunk: usize,
        concurrency: usize,
    ) -> Result<(), IndexerError> {
        let children: Vec<RowChunk<'_>> = rows
            .ins
            .chunks(chunk)
            .map(RowChunk::Ins)
            .chain(rows.outs.chunks(chunk).map(RowChunk::Outs))
            .chain(rows.fts.chunks(chunk).map(RowChunk::Fts))
            .chain(rows.nfts.chunks(chunk).map(RowChunk::Nfts))
            .collect();
        self.run_chunks(children, concurrency).await?;

        let txs: Vec<RowChunk<'_>> = rows.txs.chunks(chunk).map(RowChunk::Txs).collect();
        self.run_chunks(txs, concurrency).await
    }

    // ─── Mempool path ─────────────────────────────────────────────────────────

    /// Queue raw bytes delivered by the node's event feed.
    pub fn enqueue_raw(&self, raw: Vec<u8>) {
        self.mempool_queue.push(raw);
    }

    /// Ingest every queued mempool transaction. Undecodable payloads are
    /// dropped; a storage failure puts the payload back and stops the pass.
    pub async fn drain_mempool(&self) -> Result<usize, IndexerError> {
        let mut written = 0;
        while let Some(raw) = self.mempool_queue.pop() {
            match self.ingest_raw(&raw, IngestMode::SkipExisting).await {
                Ok(Some(_)) => written += 1,
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    self.mempool_queue.requeue_front(vec![raw]);
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "dropping undecodable mempool transaction"),
            }
        }
        Ok(written)
    }

    /// Decode and write one mempool transaction. Returns the txid when rows
    /// were written.
    pub async fn ingest_raw(
        &self,
        raw: &[u8],
        mode: IngestMode,
    ) -> Result<Option<String>, IndexerError> {
        let tx = Transaction::parse(raw)?;
        let txid = tx.txid()?;

        if mode == IngestMode::SkipExisting
            && !self.store.active_txs(std::slice::from_ref(&txid)).await?.is_empty()
        {
            tracing::debug!(%txid, "mempool transaction already indexed");
            return Ok(None);
        }

        let decoded = decode_transaction(&tx, &txid, None, chrono::Utc::now().timestamp());
        let rows = BatchRows::from_decoded(std::slice::from_ref(&decoded));
        self.write_rows(&rows, self.mempool_chunk, self.mempool_write_concurrency)
            .await?;

        tracing::debug!(%txid, inputs = decoded.inputs.len(), outputs = decoded.outputs.len(), "mempool transaction indexed");
        self.handlers
            .dispatch_tx(&IndexedTx {
                txid: txid.clone(),
                block_hash: None,
                block_height: None,
            })
            .await;
        Ok(Some(txid))
    }

    /// Fetch a transaction by id (REST first, RPC as fallback) and ingest it.
    pub async fn ingest_txid(
        &self,
        txid: &str,
        mode: IngestMode,
    ) -> Result<Option<String>, IndexerError> {
        let raw = match self.node.raw_transaction_rest(txid).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(%txid, error = %e, "REST fetch failed, trying RPC");
                self.node.raw_transaction(txid).await?
            }
        };
        self.ingest_raw(&raw, mode).await
    }

    // ─── Block path ───────────────────────────────────────────────────────────

    /// Queue the pending transactions of one block, contiguously.
    pub fn enqueue_block_items(&self, items: Vec<WorkItem>) {
        self.block_queue.push_all(items);
    }

    /// Drain the block queue, flushing whenever the batch holds more than
    /// `flush_input_threshold` inputs and once more when the queue empties.
    /// Returns the number of transactions written.
    pub async fn flush_block_batches(&self) -> Result<usize, IndexerError> {
        let mut written = 0;
        let mut items = Vec::new();
        let mut decoded = Vec::new();
        let mut inputs = 0usize;
        let now = chrono::Utc::now().timestamp();

        while let Some(item) = self.block_queue.pop() {
            let d = decode_transaction(&item.tx, &item.txid, Some(&item.block_hash), now);
            inputs += d.inputs.len();
            decoded.push(d);
            items.push(item);
            if inputs > self.flush_input_threshold {
                written += self
                    .flush(std::mem::take(&mut items), std::mem::take(&mut decoded), self.flush_chunk_large)
                    .await?;
                inputs = 0;
            }
        }
        if !items.is_empty() {
            written += self.flush(items, decoded, self.flush_chunk_small).await?;
        }
        Ok(written)
    }

    async fn flush(
        &self,
        items: Vec<WorkItem>,
        decoded: Vec<DecodedTx>,
        chunk: usize,
    ) -> Result<usize, IndexerError> {
        let rows = BatchRows::from_decoded(&decoded);
        if let Err(e) = self.write_rows(&rows, chunk, self.write_concurrency).await {
            tracing::warn!(items = items.len(), error = %e, "block batch failed, requeued");
            self.block_queue.requeue_front(items);
            return Err(e);
        }

        for item in &items {
            self.handlers
                .dispatch_tx(&IndexedTx {
                    txid: item.txid.clone(),
                    block_hash: Some(item.block_hash.clone()),
                    block_height: Some(item.block_height),
                })
                .await;
        }
        let mut first_err = None;
        for item in items.iter().filter(|i| i.is_last) {
            if let Err(e) = self
                .complete_block(&item.block_hash, item.block_height, item.block_tx_count)
                .await
            {
                tracing::warn!(block = %item.block_hash, error = %e, "block completion failed");
                first_err.get_or_insert(e);
            }
        }
        tracing::debug!(txs = items.len(), inputs = rows.ins.len(), outputs = rows.outs.len(), "block batch flushed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(items.len()),
        }
    }

    /// Mark a block fully indexed and drop its cache file. Skipped when the
    /// block left `Processing` in the meantime (reset or reorged).
    pub async fn complete_block(
        &self,
        hash: &str,
        height: u64,
        tx_count: u64,
    ) -> Result<(), IndexerError> {
        let Some(block) = self.store.block(hash).await? else {
            return Ok(());
        };
        if block.is_reorg || !block.process_status.can_transition_to(ProcessStatus::Completed) {
            tracing::debug!(block = %hash, status = %block.process_status, "skipping completion");
            return Ok(());
        }
        self.store
            .set_block_status(hash, ProcessStatus::Completed, Some(tx_count))
            .await?;
        self.cache.evict(hash).await?;
        tracing::info!(block = %hash, height, txs = tx_count, "block indexed");
        self.handlers
            .dispatch_block(&CompletedBlock {
                hash: hash.to_string(),
                height,
                tx_count,
            })
            .await;
        Ok(())
    }

    // ─── Spend marking ────────────────────────────────────────────────────────

    /// Mark spends for one cursor window starting at the lowest unprocessed
    /// input at or after `from`. Returns where the next call should start;
    /// `0` once the end of the input table is reached.
    pub async fn mark_spent(&self, from: i64) -> Result<i64, IndexerError> {
        let Some(start) = self.store.first_unprocessed_input(from).await? else {
            return Ok(0);
        };
        let end = start + self.spend_window;
        let marked = self.store.mark_spent_window(start, end).await?;
        if marked > 0 {
            tracing::debug!(start, end, marked, "spends marked");
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TxInput, TxOutput};
    use crate::script::build;
    use crate::types::ScriptType;

    fn tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TxInput {
                    prev_txid: "aa".repeat(32),
                    prev_index: 0,
                    script_sig: vec![],
                    sequence: 0,
                },
                TxInput {
                    prev_txid: "bb".repeat(32),
                    prev_index: 3,
                    script_sig: vec![],
                    sequence: 0,
                },
            ],
            outputs: vec![
                TxOutput {
                    value: 1_000,
                    script: build::p2pkh([0x01; 20]),
                },
                TxOutput {
                    value: 0,
                    script: vec![0x00, 0x6a, 0x01, 0x01],
                },
                TxOutput {
                    value: 1,
                    script: build::ft_script(
                        &[0x51],
                        "T",
                        "T",
                        0,
                        [0x02; 20],
                        500,
                        [0x03; 20],
                        &"00".repeat(36),
                    ),
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn decode_counts_and_keys() {
        let d = decode_transaction(&tx(), "t1", Some("blk"), 7);
        assert_eq!(d.tx.tx_in_num, 2);
        assert_eq!(d.tx.tx_in_coinbase, 0);
        assert_eq!(d.tx.tx_out_num, 3);
        assert_eq!(d.tx.tx_out_zero_value, 1);
        assert_eq!(d.tx.block_hash.as_deref(), Some("blk"));
        assert_eq!(d.tx.created_at, 7);

        let spent: Vec<_> = d.inputs.iter().map(|i| i.outpoint.as_str()).collect();
        assert_eq!(spent, [format!("{}_0", "aa".repeat(32)), format!("{}_3", "bb".repeat(32))]);

        let own: Vec<_> = d.outputs.iter().map(|o| o.outpoint.as_str()).collect();
        assert_eq!(own, ["t1_0", "t1_2"]);
        assert_eq!(d.outputs[0].script_type, ScriptType::P2pkh);
        assert_eq!(d.outputs[1].script_type, ScriptType::FungibleToken);
        assert_eq!(d.fts.len(), 1);
        assert_eq!(d.fts[0].outpoint, "t1_2");
        assert_eq!(d.fts[0].amount, "500");
        assert!(d.tx.is_complete(crate::types::ChildCounts { inputs: 2, outputs: 2 }));
    }

    #[test]
    fn coinbase_input_is_counted_not_stored() {
        let mut cb = tx();
        cb.inputs.truncate(1);
        cb.inputs[0].prev_txid = "0".repeat(64);
        cb.inputs[0].prev_index = u32::MAX;
        let d = decode_transaction(&cb, "cb", Some("blk"), 0);
        assert_eq!(d.tx.tx_in_coinbase, 1);
        assert!(d.inputs.is_empty());
        assert_eq!(d.tx.expected_inputs(), 0);
    }
}
