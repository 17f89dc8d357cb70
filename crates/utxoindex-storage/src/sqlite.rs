//! SQLite storage backend for UtxoIndex.
//!
//! Persists blocks, transactions, inputs, outputs and token side rows in a
//! single SQLite file. Every `IndexStore` call is one statement or one
//! short transaction; upserts are `INSERT .. ON CONFLICT DO UPDATE` that
//! leave the preserved columns alone.
//!
//! # Usage
//! ```rust,no_run
//! use utxoindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./utxoindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use utxoindex_core::error::IndexerError;
use utxoindex_core::store::IndexStore;
use utxoindex_core::types::{
    BlockFlags, BlockRecord, BlockTotals, ChildCounts, FtRecord, NftRecord, NotifyStatus,
    ProcessStatus, ScriptType, SyncProgress, TokenCheck, TxInRecord, TxOutRecord, TxRecord,
};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        cursor_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        hash           TEXT    NOT NULL UNIQUE,
        height         INTEGER NOT NULL,
        prev_hash      TEXT,
        merkle_root    TEXT    NOT NULL,
        version_hex    TEXT    NOT NULL,
        time           INTEGER NOT NULL,
        median_time    INTEGER NOT NULL,
        nonce          INTEGER NOT NULL,
        bits           TEXT    NOT NULL,
        difficulty     REAL    NOT NULL,
        chainwork      TEXT    NOT NULL,
        size           INTEGER NOT NULL,
        num_tx         INTEGER NOT NULL,
        process_count  INTEGER NOT NULL DEFAULT 0,
        is_chaintips   INTEGER NOT NULL DEFAULT 0,
        is_tail        INTEGER NOT NULL DEFAULT 0,
        is_reorg       INTEGER NOT NULL DEFAULT 0,
        process_status INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE INDEX IF NOT EXISTS idx_blocks_prev ON blocks (prev_hash);",
    "CREATE INDEX IF NOT EXISTS idx_blocks_status ON blocks (process_status, height);",
    "CREATE TABLE IF NOT EXISTS txs (
        cursor_id          INTEGER PRIMARY KEY AUTOINCREMENT,
        txid               TEXT    NOT NULL UNIQUE,
        block_hash         TEXT,
        tx_in_num          INTEGER NOT NULL,
        tx_in_coinbase     INTEGER NOT NULL,
        tx_out_num         INTEGER NOT NULL,
        tx_out_zero_value  INTEGER NOT NULL,
        is_completed_check INTEGER NOT NULL DEFAULT 0,
        is_deleted         INTEGER NOT NULL DEFAULT 0,
        notify_status      INTEGER NOT NULL DEFAULT 0,
        created_at         INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_txs_block ON txs (block_hash);",
    "CREATE INDEX IF NOT EXISTS idx_txs_created ON txs (created_at);",
    "CREATE TABLE IF NOT EXISTS tx_ins (
        cursor_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        outpoint     TEXT    NOT NULL UNIQUE,
        txid         TEXT    NOT NULL,
        input_index  INTEGER NOT NULL,
        is_processed INTEGER NOT NULL DEFAULT 0,
        is_deleted   INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE INDEX IF NOT EXISTS idx_tx_ins_txid ON tx_ins (txid);",
    "CREATE TABLE IF NOT EXISTS tx_outs (
        cursor_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        outpoint     TEXT    NOT NULL UNIQUE,
        txid         TEXT    NOT NULL,
        output_index INTEGER NOT NULL,
        script_type  INTEGER NOT NULL,
        address_hex  TEXT    NOT NULL,
        satoshis     INTEGER NOT NULL,
        check_token  INTEGER NOT NULL DEFAULT 0,
        is_used      INTEGER NOT NULL DEFAULT 0,
        is_deleted   INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE INDEX IF NOT EXISTS idx_tx_outs_txid ON tx_outs (txid);",
    "CREATE INDEX IF NOT EXISTS idx_tx_outs_address ON tx_outs (address_hex);",
    "CREATE TABLE IF NOT EXISTS tx_out_fts (
        outpoint    TEXT    PRIMARY KEY,
        txid        TEXT    NOT NULL,
        code_hash   TEXT    NOT NULL,
        genesis     TEXT    NOT NULL,
        name        TEXT    NOT NULL,
        symbol      TEXT    NOT NULL,
        sensible_id TEXT    NOT NULL,
        decimal     INTEGER NOT NULL,
        amount      TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_fts_txid ON tx_out_fts (txid);",
    "CREATE TABLE IF NOT EXISTS tx_out_nfts (
        outpoint          TEXT    PRIMARY KEY,
        txid              TEXT    NOT NULL,
        code_hash         TEXT    NOT NULL,
        genesis           TEXT    NOT NULL,
        sensible_id       TEXT    NOT NULL,
        meta_txid         TEXT    NOT NULL,
        meta_output_index INTEGER NOT NULL,
        token_supply      TEXT    NOT NULL,
        token_index       TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_nfts_txid ON tx_out_nfts (txid);",
];

const BLOCK_COLUMNS: &str = "cursor_id, hash, height, prev_hash, merkle_root, version_hex, time, \
    median_time, nonce, bits, difficulty, chainwork, size, num_tx, process_count, is_chaintips, \
    is_tail, is_reorg, process_status";

const TX_COLUMNS: &str = "cursor_id, txid, block_hash, tx_in_num, tx_in_coinbase, tx_out_num, \
    tx_out_zero_value, is_completed_check, is_deleted, notify_status, created_at";

const TX_IN_COLUMNS: &str = "cursor_id, outpoint, txid, input_index, is_processed, is_deleted";

const TX_OUT_COLUMNS: &str = "cursor_id, outpoint, txid, output_index, script_type, address_hex, \
    satoshis, check_token, is_used, is_deleted";

const FT_COLUMNS: &str =
    "outpoint, txid, code_hash, genesis, name, symbol, sensible_id, decimal, amount";

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn block_from_row(row: &SqliteRow) -> Result<BlockRecord, IndexerError> {
    Ok(BlockRecord {
        hash: row.try_get("hash").map_err(storage_err)?,
        height: row.try_get::<i64, _>("height").map_err(storage_err)? as u64,
        prev_hash: row.try_get("prev_hash").map_err(storage_err)?,
        merkle_root: row.try_get("merkle_root").map_err(storage_err)?,
        version_hex: row.try_get("version_hex").map_err(storage_err)?,
        time: row.try_get("time").map_err(storage_err)?,
        median_time: row.try_get("median_time").map_err(storage_err)?,
        nonce: row.try_get::<i64, _>("nonce").map_err(storage_err)? as u64,
        bits: row.try_get("bits").map_err(storage_err)?,
        difficulty: row.try_get("difficulty").map_err(storage_err)?,
        chainwork: row.try_get("chainwork").map_err(storage_err)?,
        size: row.try_get::<i64, _>("size").map_err(storage_err)? as u64,
        num_tx: row.try_get::<i64, _>("num_tx").map_err(storage_err)? as u64,
        process_count: row.try_get::<i64, _>("process_count").map_err(storage_err)? as u64,
        cursor_id: row.try_get("cursor_id").map_err(storage_err)?,
        is_chaintips: row.try_get("is_chaintips").map_err(storage_err)?,
        is_tail: row.try_get("is_tail").map_err(storage_err)?,
        is_reorg: row.try_get("is_reorg").map_err(storage_err)?,
        process_status: ProcessStatus::from_code(
            row.try_get("process_status").map_err(storage_err)?,
        )?,
    })
}

fn tx_from_row(row: &SqliteRow) -> Result<TxRecord, IndexerError> {
    Ok(TxRecord {
        txid: row.try_get("txid").map_err(storage_err)?,
        block_hash: row.try_get("block_hash").map_err(storage_err)?,
        tx_in_num: row.try_get::<i64, _>("tx_in_num").map_err(storage_err)? as u32,
        tx_in_coinbase: row.try_get::<i64, _>("tx_in_coinbase").map_err(storage_err)? as u32,
        tx_out_num: row.try_get::<i64, _>("tx_out_num").map_err(storage_err)? as u32,
        tx_out_zero_value: row.try_get::<i64, _>("tx_out_zero_value").map_err(storage_err)?
            as u32,
        is_completed_check: row.try_get("is_completed_check").map_err(storage_err)?,
        is_deleted: row.try_get("is_deleted").map_err(storage_err)?,
        notify_status: NotifyStatus::from_code(
            row.try_get("notify_status").map_err(storage_err)?,
        )?,
        cursor_id: row.try_get("cursor_id").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
    })
}

fn tx_in_from_row(row: &SqliteRow) -> Result<TxInRecord, IndexerError> {
    Ok(TxInRecord {
        outpoint: row.try_get("outpoint").map_err(storage_err)?,
        txid: row.try_get("txid").map_err(storage_err)?,
        input_index: row.try_get::<i64, _>("input_index").map_err(storage_err)? as u32,
        is_processed: row.try_get("is_processed").map_err(storage_err)?,
        is_deleted: row.try_get("is_deleted").map_err(storage_err)?,
        cursor_id: row.try_get("cursor_id").map_err(storage_err)?,
    })
}

fn tx_out_from_row(row: &SqliteRow) -> Result<TxOutRecord, IndexerError> {
    Ok(TxOutRecord {
        outpoint: row.try_get("outpoint").map_err(storage_err)?,
        txid: row.try_get("txid").map_err(storage_err)?,
        output_index: row.try_get::<i64, _>("output_index").map_err(storage_err)? as u32,
        script_type: ScriptType::from_code(row.try_get("script_type").map_err(storage_err)?),
        address_hex: row.try_get("address_hex").map_err(storage_err)?,
        satoshis: row.try_get::<i64, _>("satoshis").map_err(storage_err)? as u64,
        check_token: TokenCheck::from_code(row.try_get("check_token").map_err(storage_err)?)?,
        is_used: row.try_get("is_used").map_err(storage_err)?,
        is_deleted: row.try_get("is_deleted").map_err(storage_err)?,
        cursor_id: row.try_get("cursor_id").map_err(storage_err)?,
    })
}

fn ft_from_row(row: &SqliteRow) -> Result<FtRecord, IndexerError> {
    Ok(FtRecord {
        outpoint: row.try_get("outpoint").map_err(storage_err)?,
        txid: row.try_get("txid").map_err(storage_err)?,
        code_hash: row.try_get("code_hash").map_err(storage_err)?,
        genesis: row.try_get("genesis").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        symbol: row.try_get("symbol").map_err(storage_err)?,
        sensible_id: row.try_get("sensible_id").map_err(storage_err)?,
        decimal: row.try_get::<i64, _>("decimal").map_err(storage_err)? as u8,
        amount: row.try_get("amount").map_err(storage_err)?,
    })
}

/// Append `(?, ?, ..)` with one bind per value.
fn push_in_list(qb: &mut QueryBuilder<'_, Sqlite>, values: &[String]) {
    qb.push("(");
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value.clone());
    }
    list.push_unseparated(")");
}

fn status_codes(qb: &mut QueryBuilder<'_, Sqlite>, statuses: &[ProcessStatus]) {
    qb.push("(");
    let mut list = qb.separated(", ");
    for status in statuses {
        list.push_bind(status.code());
    }
    list.push_unseparated(")");
}

// ─── SqliteStore ──────────────────────────────────────────────────────────────

/// SQLite-backed index store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./utxoindex.db"`) or a full
    /// SQLite URL (`"sqlite:./utxoindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(storage_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Backed by a single connection that is never recycled; all data is
    /// lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self, wal: bool) -> Result<(), IndexerError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn fetch_block(&self, sql: &str, bind: Option<&str>) -> Result<Option<BlockRecord>, IndexerError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value.to_string());
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn fetch_blocks(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Vec<BlockRecord>, IndexerError> {
        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn fetch_txs(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<Vec<TxRecord>, IndexerError> {
        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn count(&self, sql: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>(0).map_err(storage_err)? as u64)
    }

    /// Set `is_deleted` on transactions and their children in one
    /// transaction.
    async fn set_txs_deleted(&self, txids: &[String], deleted: bool) -> Result<(), IndexerError> {
        if txids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for table in ["tx_ins", "tx_outs", "txs"] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {table} SET is_deleted = "));
            qb.push_bind(deleted).push(" WHERE txid IN ");
            push_in_list(&mut qb, txids);
            qb.build().execute(&mut *tx).await.map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }
}

// ─── IndexStore impl ──────────────────────────────────────────────────────────

#[async_trait]
impl IndexStore for SqliteStore {
    // ─── Blocks ───────────────────────────────────────────────────────────────

    async fn chain_tip(&self) -> Result<Option<BlockRecord>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE is_chaintips = 1 ORDER BY cursor_id DESC LIMIT 1"
        );
        self.fetch_block(&sql, None).await
    }

    async fn tail(&self) -> Result<Option<BlockRecord>, IndexerError> {
        let flagged = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE is_tail = 1 ORDER BY cursor_id DESC LIMIT 1"
        );
        if let Some(block) = self.fetch_block(&flagged, None).await? {
            return Ok(Some(block));
        }
        let rootless = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE prev_hash IS NULL ORDER BY cursor_id LIMIT 1"
        );
        self.fetch_block(&rootless, None).await
    }

    async fn block(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE hash = ?");
        self.fetch_block(&sql, Some(hash)).await
    }

    async fn active_successor(&self, hash: &str) -> Result<Option<BlockRecord>, IndexerError> {
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE prev_hash = ? AND is_reorg = 0 \
             ORDER BY cursor_id DESC LIMIT 1"
        );
        self.fetch_block(&sql, Some(hash)).await
    }

    async fn save_blocks(&self, blocks: &[BlockRecord]) -> Result<(), IndexerError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO blocks (hash, height, prev_hash, merkle_root, version_hex, time, \
             median_time, nonce, bits, difficulty, chainwork, size, num_tx, process_count, \
             is_chaintips, is_tail, is_reorg, process_status) ",
        );
        qb.push_values(blocks, |mut b, block| {
            b.push_bind(block.hash.clone())
                .push_bind(block.height as i64)
                .push_bind(block.prev_hash.clone())
                .push_bind(block.merkle_root.clone())
                .push_bind(block.version_hex.clone())
                .push_bind(block.time)
                .push_bind(block.median_time)
                .push_bind(block.nonce as i64)
                .push_bind(block.bits.clone())
                .push_bind(block.difficulty)
                .push_bind(block.chainwork.clone())
                .push_bind(block.size as i64)
                .push_bind(block.num_tx as i64)
                .push_bind(block.process_count as i64)
                .push_bind(block.is_chaintips)
                .push_bind(block.is_tail)
                .push_bind(block.is_reorg)
                .push_bind(block.process_status.code());
        });
        qb.push(
            " ON CONFLICT(hash) DO UPDATE SET height = excluded.height, \
             prev_hash = excluded.prev_hash, merkle_root = excluded.merkle_root, \
             version_hex = excluded.version_hex, time = excluded.time, \
             median_time = excluded.median_time, nonce = excluded.nonce, bits = excluded.bits, \
             difficulty = excluded.difficulty, chainwork = excluded.chainwork, \
             size = excluded.size, num_tx = excluded.num_tx, \
             is_chaintips = excluded.is_chaintips, is_tail = excluded.is_tail, \
             is_reorg = excluded.is_reorg",
        );
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        debug!(blocks = blocks.len(), "blocks saved");
        Ok(())
    }

    async fn set_block_flags(&self, flags: &[BlockFlags]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for f in flags {
            sqlx::query(
                "UPDATE blocks SET is_chaintips = ?, is_tail = ?, is_reorg = ?, \
                 process_status = CASE WHEN ? THEN 0 ELSE process_status END, \
                 process_count = CASE WHEN ? THEN 0 ELSE process_count END \
                 WHERE hash = ?",
            )
            .bind(f.is_chaintips)
            .bind(f.is_tail)
            .bind(f.is_reorg)
            .bind(f.reset_status)
            .bind(f.reset_status)
            .bind(f.hash.clone())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn set_block_status(
        &self,
        hash: &str,
        status: ProcessStatus,
        process_count: Option<u64>,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "UPDATE blocks SET process_status = ?, \
             process_count = COALESCE(?, process_count) WHERE hash = ?",
        )
        .bind(status.code())
        .bind(process_count.map(|c| c as i64))
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn count_blocks(&self, status: ProcessStatus) -> Result<u64, IndexerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM blocks WHERE is_reorg = 0 AND process_status = ?",
        )
        .bind(status.code())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(storage_err)? as u64)
    }

    async fn blocks_by_height(
        &self,
        statuses: &[ProcessStatus],
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE is_reorg = 0 AND process_status IN "
        ));
        status_codes(&mut qb, statuses);
        qb.push(" ORDER BY height, cursor_id LIMIT ").push_bind(limit as i64);
        self.fetch_blocks(qb).await
    }

    async fn blocks_by_cursor(
        &self,
        status: ProcessStatus,
        before_cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE is_reorg = 0 AND process_status = "
        ));
        qb.push_bind(status.code());
        if let Some(cursor) = before_cursor {
            qb.push(" AND cursor_id < ").push_bind(cursor);
        }
        qb.push(" ORDER BY cursor_id LIMIT ").push_bind(limit as i64);
        self.fetch_blocks(qb).await
    }

    async fn max_block_cursor(&self, status: ProcessStatus) -> Result<Option<i64>, IndexerError> {
        let row = sqlx::query(
            "SELECT MAX(cursor_id) AS max_cursor FROM blocks \
             WHERE is_reorg = 0 AND process_status = ?",
        )
        .bind(status.code())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        row.try_get("max_cursor").map_err(storage_err)
    }

    async fn incomplete_completed_blocks(
        &self,
        limit: usize,
    ) -> Result<Vec<BlockRecord>, IndexerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE is_reorg = 0 AND process_status = "
        ));
        qb.push_bind(ProcessStatus::Completed.code())
            .push(" AND num_tx != process_count ORDER BY cursor_id LIMIT ")
            .push_bind(limit as i64);
        self.fetch_blocks(qb).await
    }

    async fn recycle_completed(&self) -> Result<u64, IndexerError> {
        let result = sqlx::query("UPDATE blocks SET process_status = ? WHERE process_status = ?")
            .bind(ProcessStatus::NoStart.code())
            .bind(ProcessStatus::Completed.code())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn block_totals(&self, hash: &str) -> Result<BlockTotals, IndexerError> {
        let declared = sqlx::query(
            "SELECT COUNT(*) AS tx_rows, \
                    COALESCE(SUM(tx_in_num), 0) AS ins, \
                    COALESCE(SUM(tx_in_coinbase), 0) AS coinbase, \
                    COALESCE(SUM(tx_out_num), 0) AS outs, \
                    COALESCE(SUM(tx_out_zero_value), 0) AS zero_value \
             FROM txs WHERE block_hash = ? AND is_deleted = 0",
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let indexed = sqlx::query(
            "SELECT \
               (SELECT COUNT(*) FROM tx_ins i JOIN txs t ON i.txid = t.txid \
                 WHERE t.block_hash = ?1 AND t.is_deleted = 0 AND i.is_deleted = 0) AS ins, \
               (SELECT COUNT(*) FROM tx_outs o JOIN txs t ON o.txid = t.txid \
                 WHERE t.block_hash = ?1 AND t.is_deleted = 0 AND o.is_deleted = 0) AS outs",
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let get = |row: &SqliteRow, col: &str| -> Result<u64, IndexerError> {
            Ok(row.try_get::<i64, _>(col).map_err(storage_err)? as u64)
        };
        Ok(BlockTotals {
            tx_rows: get(&declared, "tx_rows")?,
            declared_inputs: get(&declared, "ins")?,
            coinbase_inputs: get(&declared, "coinbase")?,
            declared_outputs: get(&declared, "outs")?,
            zero_value_outputs: get(&declared, "zero_value")?,
            indexed_inputs: get(&indexed, "ins")?,
            indexed_outputs: get(&indexed, "outs")?,
        })
    }

    async fn progress(&self) -> Result<SyncProgress, IndexerError> {
        Ok(SyncProgress {
            total_blocks: self.count("SELECT COUNT(*) FROM blocks WHERE is_reorg = 0").await?,
            verified_blocks: self
                .count("SELECT COUNT(*) FROM blocks WHERE is_reorg = 0 AND process_status = 5")
                .await?,
            unprocessed_inputs: self
                .count("SELECT COUNT(*) FROM tx_ins WHERE is_deleted = 0 AND is_processed = 0")
                .await?,
        })
    }

    // ─── Transactions ─────────────────────────────────────────────────────────

    async fn active_txs(&self, txids: &[String]) -> Result<Vec<TxRecord>, IndexerError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TX_COLUMNS} FROM txs WHERE is_deleted = 0 AND txid IN "
        ));
        push_in_list(&mut qb, txids);
        self.fetch_txs(qb).await
    }

    async fn child_counts(
        &self,
        txids: &[String],
    ) -> Result<HashMap<String, ChildCounts>, IndexerError> {
        let mut counts: HashMap<String, ChildCounts> = HashMap::new();
        if txids.is_empty() {
            return Ok(counts);
        }
        for (table, is_input) in [("tx_ins", true), ("tx_outs", false)] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT txid, COUNT(*) AS cnt FROM {table} WHERE is_deleted = 0 AND txid IN "
            ));
            push_in_list(&mut qb, txids);
            qb.push(" GROUP BY txid");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
            for row in rows {
                let txid: String = row.try_get("txid").map_err(storage_err)?;
                let n = row.try_get::<i64, _>("cnt").map_err(storage_err)? as u64;
                let entry = counts.entry(txid).or_default();
                if is_input {
                    entry.inputs = n;
                } else {
                    entry.outputs = n;
                }
            }
        }
        Ok(counts)
    }

    async fn upsert_txs(&self, txs: &[TxRecord]) -> Result<(), IndexerError> {
        if txs.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO txs (txid, block_hash, tx_in_num, tx_in_coinbase, tx_out_num, \
             tx_out_zero_value, is_completed_check, is_deleted, notify_status, created_at) ",
        );
        qb.push_values(txs, |mut b, tx| {
            b.push_bind(tx.txid.clone())
                .push_bind(tx.block_hash.clone())
                .push_bind(i64::from(tx.tx_in_num))
                .push_bind(i64::from(tx.tx_in_coinbase))
                .push_bind(i64::from(tx.tx_out_num))
                .push_bind(i64::from(tx.tx_out_zero_value))
                .push_bind(tx.is_completed_check)
                .push_bind(false)
                .push_bind(tx.notify_status.code())
                .push_bind(tx.created_at);
        });
        qb.push(
            " ON CONFLICT(txid) DO UPDATE SET \
             block_hash = CASE \
                 WHEN excluded.block_hash IS NOT NULL THEN excluded.block_hash \
                 WHEN txs.is_deleted = 1 OR EXISTS (SELECT 1 FROM blocks \
                     WHERE blocks.hash = txs.block_hash AND blocks.is_reorg = 1) THEN NULL \
                 ELSE txs.block_hash END, \
             tx_in_num = excluded.tx_in_num, tx_in_coinbase = excluded.tx_in_coinbase, \
             tx_out_num = excluded.tx_out_num, tx_out_zero_value = excluded.tx_out_zero_value, \
             is_completed_check = excluded.is_completed_check, is_deleted = 0",
        );
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn upsert_tx_ins(&self, ins: &[TxInRecord]) -> Result<(), IndexerError> {
        if ins.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO tx_ins (outpoint, txid, input_index, is_processed, is_deleted) ",
        );
        qb.push_values(ins, |mut b, input| {
            b.push_bind(input.outpoint.clone())
                .push_bind(input.txid.clone())
                .push_bind(i64::from(input.input_index))
                .push_bind(input.is_processed)
                .push_bind(false);
        });
        qb.push(
            " ON CONFLICT(outpoint) DO UPDATE SET txid = excluded.txid, \
             input_index = excluded.input_index, is_deleted = 0",
        );
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn upsert_tx_outs(&self, outs: &[TxOutRecord]) -> Result<(), IndexerError> {
        if outs.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO tx_outs (outpoint, txid, output_index, script_type, address_hex, \
             satoshis, check_token, is_used, is_deleted) ",
        );
        qb.push_values(outs, |mut b, output| {
            b.push_bind(output.outpoint.clone())
                .push_bind(output.txid.clone())
                .push_bind(i64::from(output.output_index))
                .push_bind(output.script_type.code())
                .push_bind(output.address_hex.clone())
                .push_bind(output.satoshis as i64)
                .push_bind(output.check_token.code())
                .push_bind(output.is_used)
                .push_bind(false);
        });
        qb.push(
            " ON CONFLICT(outpoint) DO UPDATE SET txid = excluded.txid, \
             output_index = excluded.output_index, script_type = excluded.script_type, \
             address_hex = excluded.address_hex, satoshis = excluded.satoshis, is_deleted = 0",
        );
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn upsert_fts(&self, fts: &[FtRecord]) -> Result<(), IndexerError> {
        if fts.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT OR REPLACE INTO tx_out_fts ({FT_COLUMNS}) "
        ));
        qb.push_values(fts, |mut b, ft| {
            b.push_bind(ft.outpoint.clone())
                .push_bind(ft.txid.clone())
                .push_bind(ft.code_hash.clone())
                .push_bind(ft.genesis.clone())
                .push_bind(ft.name.clone())
                .push_bind(ft.symbol.clone())
                .push_bind(ft.sensible_id.clone())
                .push_bind(i64::from(ft.decimal))
                .push_bind(ft.amount.clone());
        });
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn upsert_nfts(&self, nfts: &[NftRecord]) -> Result<(), IndexerError> {
        if nfts.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT OR REPLACE INTO tx_out_nfts (outpoint, txid, code_hash, genesis, \
             sensible_id, meta_txid, meta_output_index, token_supply, token_index) ",
        );
        qb.push_values(nfts, |mut b, nft| {
            b.push_bind(nft.outpoint.clone())
                .push_bind(nft.txid.clone())
                .push_bind(nft.code_hash.clone())
                .push_bind(nft.genesis.clone())
                .push_bind(nft.sensible_id.clone())
                .push_bind(nft.meta_txid.clone())
                .push_bind(i64::from(nft.meta_output_index))
                .push_bind(nft.token_supply.clone())
                .push_bind(nft.token_index.clone());
        });
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn restore_txs(&self, txids: &[String]) -> Result<(), IndexerError> {
        self.set_txs_deleted(txids, false).await
    }

    async fn soft_delete_txs(&self, txids: &[String]) -> Result<(), IndexerError> {
        self.set_txs_deleted(txids, true).await
    }

    async fn mark_completed_check(&self, txids: &[String]) -> Result<(), IndexerError> {
        if txids.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE txs SET is_completed_check = 1 WHERE txid IN ");
        push_in_list(&mut qb, txids);
        qb.build().execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    async fn mark_block_txs_checked(&self, block_hash: &str) -> Result<(), IndexerError> {
        sqlx::query(
            "UPDATE txs SET is_completed_check = 1 WHERE block_hash = ? AND is_deleted = 0",
        )
        .bind(block_hash)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn set_block_txs_deleted(
        &self,
        block_hashes: &[String],
        deleted: bool,
    ) -> Result<u64, IndexerError> {
        if block_hashes.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        // Children first: the subquery selects transactions still in the
        // opposite state.
        for table in ["tx_ins", "tx_outs"] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {table} SET is_deleted = "));
            qb.push_bind(deleted)
                .push(" WHERE txid IN (SELECT txid FROM txs WHERE is_deleted = ")
                .push_bind(!deleted)
                .push(" AND block_hash IN ");
            push_in_list(&mut qb, block_hashes);
            qb.push(")");
            qb.build().execute(&mut *tx).await.map_err(storage_err)?;
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE txs SET is_deleted = ");
        qb.push_bind(deleted)
            .push(" WHERE is_deleted = ")
            .push_bind(!deleted)
            .push(" AND block_hash IN ");
        push_in_list(&mut qb, block_hashes);
        let changed = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();
        tx.commit().await.map_err(storage_err)?;
        Ok(changed)
    }

    async fn purge_coinbase_txs(
        &self,
        block_hashes: &[String],
    ) -> Result<Vec<String>, IndexerError> {
        if block_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT txid FROM txs WHERE tx_in_coinbase = 1 AND block_hash IN ",
        );
        push_in_list(&mut qb, block_hashes);
        let txids: Vec<String> = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?
            .iter()
            .map(|row| row.try_get("txid").map_err(storage_err))
            .collect::<Result<_, _>>()?;

        if !txids.is_empty() {
            for table in ["tx_out_fts", "tx_out_nfts", "tx_outs", "tx_ins", "txs"] {
                let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE txid IN "));
                push_in_list(&mut qb, &txids);
                qb.build().execute(&mut *tx).await.map_err(storage_err)?;
            }
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(txids)
    }

    async fn unconfirmed_unchecked(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TX_COLUMNS} FROM txs WHERE block_hash IS NULL AND is_deleted = 0 \
             AND is_completed_check = 0 AND cursor_id > "
        ));
        qb.push_bind(after_cursor)
            .push(" ORDER BY cursor_id LIMIT ")
            .push_bind(limit as i64);
        self.fetch_txs(qb).await
    }

    async fn unconfirmed_before(
        &self,
        created_before: i64,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TX_COLUMNS} FROM txs WHERE block_hash IS NULL AND is_deleted = 0 \
             AND created_at < "
        ));
        qb.push_bind(created_before)
            .push(" AND cursor_id > ")
            .push_bind(after_cursor)
            .push(" ORDER BY cursor_id LIMIT ")
            .push_bind(limit as i64);
        self.fetch_txs(qb).await
    }

    // ─── Spends ───────────────────────────────────────────────────────────────

    async fn first_unprocessed_input(
        &self,
        from_cursor: i64,
    ) -> Result<Option<i64>, IndexerError> {
        let row = sqlx::query(
            "SELECT MIN(cursor_id) AS first FROM tx_ins \
             WHERE is_deleted = 0 AND is_processed = 0 AND cursor_id >= ?",
        )
        .bind(from_cursor)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        row.try_get("first").map_err(storage_err)
    }

    async fn mark_spent_window(&self, from: i64, to: i64) -> Result<u64, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query(
            "UPDATE tx_outs SET is_used = 1 WHERE outpoint IN ( \
               SELECT outpoint FROM tx_ins WHERE cursor_id >= ? AND cursor_id < ? \
               AND is_deleted = 0 AND is_processed = 0)",
        )
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        let marked = sqlx::query(
            "UPDATE tx_ins SET is_processed = 1 \
             WHERE cursor_id >= ? AND cursor_id < ? AND is_deleted = 0 AND is_processed = 0 \
             AND outpoint IN (SELECT outpoint FROM tx_outs)",
        )
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();
        tx.commit().await.map_err(storage_err)?;
        Ok(marked)
    }

    async fn repair_spend_flags(&self) -> Result<(u64, u64), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let outputs = sqlx::query(
            "UPDATE tx_outs SET is_used = 1 WHERE is_used = 0 AND outpoint IN ( \
               SELECT outpoint FROM tx_ins WHERE is_processed = 1 AND is_deleted = 0)",
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();
        let inputs = sqlx::query(
            "UPDATE tx_ins SET is_processed = 1 WHERE is_processed = 0 AND outpoint IN ( \
               SELECT outpoint FROM tx_outs WHERE is_used = 1)",
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();
        tx.commit().await.map_err(storage_err)?;
        Ok((outputs, inputs))
    }

    // ─── Tokens ───────────────────────────────────────────────────────────────

    async fn unchecked_ft_outputs(
        &self,
        after_cursor: i64,
        limit: usize,
    ) -> Result<Vec<(TxOutRecord, FtRecord)>, IndexerError> {
        let rows = sqlx::query(
            "SELECT o.cursor_id, o.outpoint, o.txid, o.output_index, o.script_type, \
                    o.address_hex, o.satoshis, o.check_token, o.is_used, o.is_deleted, \
                    f.code_hash, f.genesis, f.name, f.symbol, f.sensible_id, f.decimal, f.amount \
             FROM tx_outs o JOIN tx_out_fts f ON o.outpoint = f.outpoint \
             WHERE o.script_type = ? AND o.check_token = ? AND o.is_deleted = 0 \
               AND o.cursor_id > ? \
             ORDER BY o.cursor_id LIMIT ?",
        )
        .bind(ScriptType::FungibleToken.code())
        .bind(TokenCheck::Uncheck.code())
        .bind(after_cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| Ok((tx_out_from_row(row)?, ft_from_row(row)?)))
            .collect()
    }

    async fn tx_ins_of(&self, txid: &str) -> Result<Vec<TxInRecord>, IndexerError> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_IN_COLUMNS} FROM tx_ins WHERE txid = ? AND is_deleted = 0 \
             ORDER BY input_index"
        ))
        .bind(txid)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(tx_in_from_row).collect()
    }

    async fn ft_outputs(&self, outpoints: &[String]) -> Result<Vec<FtRecord>, IndexerError> {
        if outpoints.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FT_COLUMNS} FROM tx_out_fts WHERE outpoint IN "
        ));
        push_in_list(&mut qb, outpoints);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(ft_from_row).collect()
    }

    async fn ft_outputs_of_tx(&self, txid: &str) -> Result<Vec<FtRecord>, IndexerError> {
        let rows = sqlx::query(&format!(
            "SELECT {FT_COLUMNS} FROM tx_out_fts WHERE txid = ? ORDER BY outpoint"
        ))
        .bind(txid)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(ft_from_row).collect()
    }

    async fn spender(&self, outpoint: &str) -> Result<Option<TxInRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT {TX_IN_COLUMNS} FROM tx_ins WHERE outpoint = ? AND is_deleted = 0"
        ))
        .bind(outpoint)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(tx_in_from_row).transpose()
    }

    async fn set_token_checks(&self, checks: &[(String, TokenCheck)]) -> Result<(), IndexerError> {
        if checks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for (outpoint, check) in checks {
            sqlx::query("UPDATE tx_outs SET check_token = ? WHERE outpoint = ?")
                .bind(check.code())
                .bind(outpoint.clone())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(outputs = checks.len(), "token checks stored");
        Ok(())
    }
}

impl SqliteStore {
    /// A single output row, deleted or not.
    pub async fn tx_out(&self, outpoint: &str) -> Result<Option<TxOutRecord>, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT {TX_OUT_COLUMNS} FROM tx_outs WHERE outpoint = ?"
        ))
        .bind(outpoint)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(tx_out_from_row).transpose()
    }

    /// A single transaction row, deleted or not.
    pub async fn tx(&self, txid: &str) -> Result<Option<TxRecord>, IndexerError> {
        let row = sqlx::query(&format!("SELECT {TX_COLUMNS} FROM txs WHERE txid = ?"))
            .bind(txid)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(tx_from_row).transpose()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use utxoindex_core::types::BlockHeader;

    fn header(hash: &str, height: u64, prev: Option<&str>) -> BlockRecord {
        BlockRecord::from_header(&BlockHeader {
            hash: hash.into(),
            height,
            size: Some(285),
            version_hex: "20000000".into(),
            merkle_root: "mr".into(),
            num_tx: 2,
            time: 1_700_000_000,
            median_time: 1_699_999_000,
            nonce: 7,
            bits: "1d00ffff".into(),
            difficulty: 1.0,
            chainwork: "00ff".into(),
            previous_block_hash: prev.map(Into::into),
        })
    }

    fn tx(txid: &str, block: Option<&str>, coinbase: bool) -> TxRecord {
        TxRecord {
            txid: txid.into(),
            block_hash: block.map(Into::into),
            tx_in_num: 1,
            tx_in_coinbase: u32::from(coinbase),
            tx_out_num: 1,
            tx_out_zero_value: 0,
            is_completed_check: false,
            is_deleted: false,
            notify_status: NotifyStatus::NoStart,
            cursor_id: 0,
            created_at: 100,
        }
    }

    fn tx_in(outpoint: &str, txid: &str) -> TxInRecord {
        TxInRecord {
            outpoint: outpoint.into(),
            txid: txid.into(),
            input_index: 0,
            is_processed: false,
            is_deleted: false,
            cursor_id: 0,
        }
    }

    fn tx_out(txid: &str, script_type: ScriptType) -> TxOutRecord {
        TxOutRecord {
            outpoint: format!("{txid}_0"),
            txid: txid.into(),
            output_index: 0,
            script_type,
            address_hex: "unknown".into(),
            satoshis: 1_000,
            check_token: TokenCheck::Uncheck,
            is_used: false,
            is_deleted: false,
            cursor_id: 0,
        }
    }

    // ── Blocks ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn resaved_block_keeps_status_and_cursor() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut b = header("b1", 1, Some("b0"));
        b.is_chaintips = true;
        store.save_blocks(&[header("b0", 0, None), b.clone()]).await.unwrap();
        store
            .set_block_status("b1", ProcessStatus::Processing, Some(1))
            .await
            .unwrap();

        let before = store.block("b1").await.unwrap().unwrap();
        b.is_chaintips = false;
        store.save_blocks(&[b]).await.unwrap();
        let after = store.block("b1").await.unwrap().unwrap();
        assert_eq!(after.cursor_id, before.cursor_id);
        assert_eq!(after.process_status, ProcessStatus::Processing);
        assert_eq!(after.process_count, 1);
        assert!(!after.is_chaintips);

        assert_eq!(store.tail().await.unwrap().unwrap().hash, "b0");
        assert_eq!(store.active_successor("b0").await.unwrap().unwrap().hash, "b1");
        assert_eq!(
            store.max_block_cursor(ProcessStatus::Processing).await.unwrap(),
            Some(after.cursor_id)
        );
        assert_eq!(store.max_block_cursor(ProcessStatus::Completed).await.unwrap(), None);
    }

    #[tokio::test]
    async fn flags_reset_status_and_hide_reorged_blocks() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_blocks(&[header("a", 5, None), header("b", 6, Some("a"))]).await.unwrap();
        store.set_block_status("b", ProcessStatus::Completed, Some(2)).await.unwrap();
        store
            .set_block_flags(&[BlockFlags {
                hash: "b".into(),
                is_chaintips: false,
                is_tail: false,
                is_reorg: true,
                reset_status: true,
            }])
            .await
            .unwrap();

        let b = store.block("b").await.unwrap().unwrap();
        assert!(b.is_reorg);
        assert_eq!(b.process_status, ProcessStatus::NoStart);
        assert_eq!(b.process_count, 0);
        assert!(store.active_successor("a").await.unwrap().is_none());

        let pending = store
            .blocks_by_height(&[ProcessStatus::NoStart, ProcessStatus::Downloading], 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash, "a");
    }

    // ── Transactions ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tx_upsert_preserves_cursor_and_block_hash() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_txs(&[tx("t1", Some("blk"), false)]).await.unwrap();
        let first = store.tx("t1").await.unwrap().unwrap();

        let mut again = tx("t1", None, false);
        again.created_at = 999;
        store.upsert_txs(&[again]).await.unwrap();
        let row = store.tx("t1").await.unwrap().unwrap();
        assert_eq!(row.cursor_id, first.cursor_id);
        assert_eq!(row.block_hash.as_deref(), Some("blk"));
        assert_eq!(row.created_at, 100);
    }

    #[tokio::test]
    async fn mempool_rewrite_drops_stale_block_hash() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .save_blocks(&[header("live", 5, None), header("orphan", 6, Some("live"))])
            .await
            .unwrap();
        store
            .set_block_flags(&[BlockFlags {
                hash: "orphan".into(),
                is_chaintips: false,
                is_tail: false,
                is_reorg: true,
                reset_status: true,
            }])
            .await
            .unwrap();
        store
            .upsert_txs(&[
                tx("in_orphan", Some("orphan"), false),
                tx("hidden", Some("live"), false),
                tx("confirmed", Some("live"), false),
            ])
            .await
            .unwrap();
        store.soft_delete_txs(&["hidden".to_string()]).await.unwrap();

        store
            .upsert_txs(&[
                tx("in_orphan", None, false),
                tx("hidden", None, false),
                tx("confirmed", None, false),
            ])
            .await
            .unwrap();
        let block_of = |row: Option<TxRecord>| row.unwrap().block_hash;
        assert_eq!(block_of(store.tx("in_orphan").await.unwrap()), None);
        assert_eq!(block_of(store.tx("hidden").await.unwrap()), None);
        assert_eq!(block_of(store.tx("confirmed").await.unwrap()).as_deref(), Some("live"));
        assert_eq!(store.unconfirmed_unchecked(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn soft_delete_restore_and_child_counts() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_tx_ins(&[tx_in("p_0", "t1")]).await.unwrap();
        store.upsert_tx_outs(&[tx_out("t1", ScriptType::P2pkh)]).await.unwrap();
        store.upsert_txs(&[tx("t1", None, false)]).await.unwrap();

        let ids = vec!["t1".to_string()];
        let counts = store.child_counts(&ids).await.unwrap();
        assert_eq!(counts["t1"], ChildCounts { inputs: 1, outputs: 1 });

        store.soft_delete_txs(&ids).await.unwrap();
        assert!(store.active_txs(&ids).await.unwrap().is_empty());
        assert!(store.child_counts(&ids).await.unwrap().is_empty());

        store.restore_txs(&ids).await.unwrap();
        assert_eq!(store.active_txs(&ids).await.unwrap().len(), 1);
        assert_eq!(store.unconfirmed_unchecked(0, 10).await.unwrap().len(), 1);
        store.mark_completed_check(&ids).await.unwrap();
        assert!(store.unconfirmed_unchecked(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reorg_helpers_purge_coinbase_and_hide_the_rest() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_tx_outs(&[tx_out("cb", ScriptType::P2pkh), tx_out("t2", ScriptType::P2pkh)])
            .await
            .unwrap();
        store.upsert_tx_ins(&[tx_in("cb_0", "t2")]).await.unwrap();
        store
            .upsert_txs(&[tx("cb", Some("blk"), true), tx("t2", Some("blk"), false)])
            .await
            .unwrap();

        let blocks = vec!["blk".to_string()];
        assert_eq!(store.purge_coinbase_txs(&blocks).await.unwrap(), vec!["cb".to_string()]);
        assert!(store.tx("cb").await.unwrap().is_none());
        assert!(store.tx_out("cb_0").await.unwrap().is_none());

        assert_eq!(store.set_block_txs_deleted(&blocks, true).await.unwrap(), 1);
        assert!(store.tx("t2").await.unwrap().unwrap().is_deleted);
        assert!(store.tx_out("t2_0").await.unwrap().unwrap().is_deleted);
        assert!(store.spender("cb_0").await.unwrap().is_none());
        assert_eq!(store.set_block_txs_deleted(&blocks, true).await.unwrap(), 0);

        assert_eq!(store.set_block_txs_deleted(&blocks, false).await.unwrap(), 1);
        assert!(!store.tx_out("t2_0").await.unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn block_totals_count_live_children() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_tx_outs(&[tx_out("cb", ScriptType::P2pkh), tx_out("t2", ScriptType::P2pkh)]).await.unwrap();
        store.upsert_tx_ins(&[tx_in("cb_0", "t2")]).await.unwrap();
        store
            .upsert_txs(&[tx("cb", Some("blk"), true), tx("t2", Some("blk"), false)])
            .await
            .unwrap();

        let totals = store.block_totals("blk").await.unwrap();
        assert_eq!(totals.tx_rows, 2);
        assert_eq!(totals.coinbase_inputs, 1);
        assert_eq!(totals.indexed_inputs, 1);
        assert_eq!(totals.indexed_outputs, 2);
        assert!(totals.is_consistent(2));
    }

    // ── Spends ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spend_window_marks_both_sides() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_tx_outs(&[tx_out("a", ScriptType::P2pkh)]).await.unwrap();
        store
            .upsert_tx_ins(&[tx_in("a_0", "b"), tx_in("missing_0", "b")])
            .await
            .unwrap();

        let start = store.first_unprocessed_input(0).await.unwrap().unwrap();
        assert_eq!(store.mark_spent_window(start, start + 100).await.unwrap(), 1);
        assert!(store.tx_out("a_0").await.unwrap().unwrap().is_used);

        // The input whose output is unknown stays pending.
        let next = store.first_unprocessed_input(0).await.unwrap().unwrap();
        assert!(next > start);
        assert_eq!(store.progress().await.unwrap().unprocessed_inputs, 1);
    }

    #[tokio::test]
    async fn repair_propagates_spend_flags() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut used = tx_out("a", ScriptType::P2pkh);
        used.is_used = true;
        let mut processed = tx_in("c_0", "d");
        processed.is_processed = true;
        store.upsert_tx_outs(&[used, tx_out("c", ScriptType::P2pkh)]).await.unwrap();
        store.upsert_tx_ins(&[tx_in("a_0", "b"), processed]).await.unwrap();

        assert_eq!(store.repair_spend_flags().await.unwrap(), (1, 1));
        assert_eq!(store.repair_spend_flags().await.unwrap(), (0, 0));
    }

    // ── Tokens ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unchecked_ft_outputs_join_token_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_tx_outs(&[tx_out("f", ScriptType::FungibleToken), tx_out("p", ScriptType::P2pkh)])
            .await
            .unwrap();
        store
            .upsert_fts(&[FtRecord {
                outpoint: "f_0".into(),
                txid: "f".into(),
                code_hash: "c".into(),
                genesis: "g".into(),
                name: "Token".into(),
                symbol: "TK".into(),
                sensible_id: "00".repeat(36),
                decimal: 8,
                amount: "18446744073709551615".into(),
            }])
            .await
            .unwrap();

        let page = store.unchecked_ft_outputs(0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].1.amount, "18446744073709551615");
        assert_eq!(page[0].1.decimal, 8);

        store
            .set_token_checks(&[("f_0".to_string(), TokenCheck::Passed)])
            .await
            .unwrap();
        assert!(store.unchecked_ft_outputs(0, 10).await.unwrap().is_empty());

        // A re-written output keeps its verdict.
        store.upsert_tx_outs(&[tx_out("f", ScriptType::FungibleToken)]).await.unwrap();
        assert_eq!(
            store.tx_out("f_0").await.unwrap().unwrap().check_token,
            TokenCheck::Passed
        );
        assert_eq!(store.ft_outputs_of_tx("f").await.unwrap().len(), 1);
    }
}
