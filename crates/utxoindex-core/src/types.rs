//! Shared types for the indexing pipeline: persisted records, status state
//! machines and node responses.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Address sentinel for outputs that carry no recognizable owner.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Build the `"{txid}_{index}"` key used for outpoints.
pub fn outpoint_key(txid: &str, index: u32) -> String {
    format!("{txid}_{index}")
}

/// Split an outpoint key back into `(txid, index)`.
pub fn split_outpoint(outpoint: &str) -> Option<(&str, u32)> {
    let (txid, index) = outpoint.rsplit_once('_')?;
    Some((txid, index.parse().ok()?))
}

// ─── ProcessStatus ────────────────────────────────────────────────────────────

/// Per-block processing state.
///
/// ```text
/// NoStart → Downloading → Downloaded → Processing → Completed → DoubleCheck
///    ↑___________________________ any failure ___________________________|
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NoStart,
    Downloading,
    Downloaded,
    Processing,
    Completed,
    DoubleCheck,
}

impl ProcessStatus {
    /// Stable integer code used by storage backends.
    pub fn code(self) -> i64 {
        match self {
            Self::NoStart => 0,
            Self::Downloading => 1,
            Self::Downloaded => 2,
            Self::Processing => 3,
            Self::Completed => 4,
            Self::DoubleCheck => 5,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, IndexerError> {
        Ok(match code {
            0 => Self::NoStart,
            1 => Self::Downloading,
            2 => Self::Downloaded,
            3 => Self::Processing,
            4 => Self::Completed,
            5 => Self::DoubleCheck,
            other => {
                return Err(IndexerError::Decode(format!(
                    "unknown block process status {other}"
                )))
            }
        })
    }

    /// Returns `true` if moving from `self` to `next` is a legal step.
    ///
    /// Resetting to `NoStart` and re-entering the current state are always
    /// allowed. `Completed → Processing` covers blocks re-selected because
    /// their processed count disagrees with their transaction count.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        if next == NoStart || next == self {
            return true;
        }
        matches!(
            (self, next),
            (NoStart, Downloading)
                | (Downloading, Downloaded)
                | (Downloaded, Processing)
                | (Processing, Completed)
                | (Completed, Processing)
                | (Completed, DoubleCheck)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: ProcessStatus) -> Result<ProcessStatus, IndexerError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(IndexerError::InvalidTransition {
                entity: "block",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoStart => "nostart",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::DoubleCheck => "double_check",
        };
        f.write_str(s)
    }
}

// ─── TokenCheck ───────────────────────────────────────────────────────────────

/// Token provenance verdict for a fungible-token output. `Passed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCheck {
    Uncheck,
    Passed,
    Failed,
}

impl TokenCheck {
    pub fn code(self) -> i64 {
        match self {
            Self::Uncheck => 0,
            Self::Passed => 1,
            Self::Failed => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, IndexerError> {
        match code {
            0 => Ok(Self::Uncheck),
            1 => Ok(Self::Passed),
            2 => Ok(Self::Failed),
            other => Err(IndexerError::Decode(format!("unknown token check {other}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Uncheck)
    }

    pub fn transition(self, next: TokenCheck) -> Result<TokenCheck, IndexerError> {
        if self == next || (self == Self::Uncheck && next.is_terminal()) {
            Ok(next)
        } else {
            Err(IndexerError::InvalidTransition {
                entity: "token check",
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

// ─── NotifyStatus ─────────────────────────────────────────────────────────────

/// Webhook notification state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    NoStart,
    ShouldNotify,
    Completed,
}

impl NotifyStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::NoStart => 0,
            Self::ShouldNotify => 1,
            Self::Completed => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, IndexerError> {
        match code {
            0 => Ok(Self::NoStart),
            1 => Ok(Self::ShouldNotify),
            2 => Ok(Self::Completed),
            other => Err(IndexerError::Decode(format!("unknown notify status {other}"))),
        }
    }

    pub fn transition(self, next: NotifyStatus) -> Result<NotifyStatus, IndexerError> {
        use NotifyStatus::*;
        match (self, next) {
            (a, b) if a == b => Ok(next),
            (NoStart, ShouldNotify) | (ShouldNotify, Completed) => Ok(next),
            _ => Err(IndexerError::InvalidTransition {
                entity: "notify",
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            }),
        }
    }
}

// ─── ScriptType ───────────────────────────────────────────────────────────────

/// Classification of an output locking script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    OpReturn,
    FungibleToken,
    NonFungibleToken,
    Unknown,
}

impl ScriptType {
    pub fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::P2pkh => 1,
            Self::OpReturn => 2,
            Self::FungibleToken => 3,
            Self::NonFungibleToken => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::P2pkh,
            2 => Self::OpReturn,
            3 => Self::FungibleToken,
            4 => Self::NonFungibleToken,
            _ => Self::Unknown,
        }
    }
}

// ─── Node responses ───────────────────────────────────────────────────────────

/// Verbose `getblockheader` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "versionHex", default)]
    pub version_hex: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub num_tx: u64,
    pub time: i64,
    #[serde(rename = "mediantime", default)]
    pub median_time: i64,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub chainwork: String,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
}

/// Subset of `getmempoolinfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MempoolInfo {
    pub size: u64,
    #[serde(default)]
    pub bytes: u64,
}

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(default)]
    pub headers: u64,
    #[serde(rename = "bestblockhash", default)]
    pub best_block_hash: String,
}

// ─── BlockRecord ──────────────────────────────────────────────────────────────

/// A block header tracked by the indexer plus its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: String,
    pub height: u64,
    /// `None` only for the chain's first block.
    pub prev_hash: Option<String>,
    pub merkle_root: String,
    pub version_hex: String,
    pub time: i64,
    pub median_time: i64,
    pub nonce: u64,
    pub bits: String,
    pub difficulty: f64,
    pub chainwork: String,
    pub size: u64,
    pub num_tx: u64,
    /// Number of transactions known to be fully indexed.
    pub process_count: u64,
    /// Insertion sequence, assigned by the store.
    pub cursor_id: i64,
    pub is_chaintips: bool,
    pub is_tail: bool,
    pub is_reorg: bool,
    pub process_status: ProcessStatus,
}

impl BlockRecord {
    /// A fresh, unprocessed record for a header fetched from the node.
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash.clone(),
            height: header.height,
            prev_hash: header.previous_block_hash.clone(),
            merkle_root: header.merkle_root.clone(),
            version_hex: header.version_hex.clone(),
            time: header.time,
            median_time: header.median_time,
            nonce: header.nonce,
            bits: header.bits.clone(),
            difficulty: header.difficulty,
            chainwork: header.chainwork.clone(),
            size: header.size.unwrap_or(0),
            num_tx: header.num_tx,
            process_count: 0,
            cursor_id: 0,
            is_chaintips: false,
            is_tail: false,
            is_reorg: false,
            process_status: ProcessStatus::NoStart,
        }
    }
}

/// Flag update for an already stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFlags {
    pub hash: String,
    pub is_chaintips: bool,
    pub is_tail: bool,
    pub is_reorg: bool,
    /// Also reset `process_status` to `NoStart` and `process_count` to 0.
    pub reset_status: bool,
}

// ─── Transaction records ──────────────────────────────────────────────────────

/// Transaction row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: String,
    /// `None` while the transaction is only in the mempool.
    pub block_hash: Option<String>,
    pub tx_in_num: u32,
    /// 1 when the only input is a coinbase input.
    pub tx_in_coinbase: u32,
    pub tx_out_num: u32,
    pub tx_out_zero_value: u32,
    pub is_completed_check: bool,
    pub is_deleted: bool,
    pub notify_status: NotifyStatus,
    pub cursor_id: i64,
    /// Unix seconds.
    pub created_at: i64,
}

impl TxRecord {
    /// Inputs that must exist as TxIn rows.
    pub fn expected_inputs(&self) -> u64 {
        u64::from(self.tx_in_num.saturating_sub(self.tx_in_coinbase))
    }

    /// Outputs that must exist as TxOut rows.
    pub fn expected_outputs(&self) -> u64 {
        u64::from(self.tx_out_num.saturating_sub(self.tx_out_zero_value))
    }

    /// Returns `true` if the live child counts match this transaction.
    pub fn is_complete(&self, counts: ChildCounts) -> bool {
        counts.inputs == self.expected_inputs() && counts.outputs == self.expected_outputs()
    }
}

/// Input row, keyed by the outpoint it spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInRecord {
    pub outpoint: String,
    pub txid: String,
    pub input_index: u32,
    pub is_processed: bool,
    pub is_deleted: bool,
    pub cursor_id: i64,
}

/// Output row, keyed by its own outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutRecord {
    pub outpoint: String,
    pub txid: String,
    pub output_index: u32,
    pub script_type: ScriptType,
    pub address_hex: String,
    pub satoshis: u64,
    pub check_token: TokenCheck,
    pub is_used: bool,
    pub is_deleted: bool,
    pub cursor_id: i64,
}

/// Fungible-token side row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtRecord {
    pub outpoint: String,
    pub txid: String,
    pub code_hash: String,
    pub genesis: String,
    pub name: String,
    pub symbol: String,
    pub sensible_id: String,
    pub decimal: u8,
    /// Decimal string, amounts can exceed `i64`.
    pub amount: String,
}

/// Non-fungible-token side row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftRecord {
    pub outpoint: String,
    pub txid: String,
    pub code_hash: String,
    pub genesis: String,
    pub sensible_id: String,
    pub meta_txid: String,
    pub meta_output_index: u32,
    pub token_supply: String,
    pub token_index: String,
}

/// Live (non-deleted) child row counts for one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildCounts {
    pub inputs: u64,
    pub outputs: u64,
}

/// Declared and indexed totals for one block, used by the double-check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTotals {
    /// Active transaction rows attached to the block.
    pub tx_rows: u64,
    pub declared_inputs: u64,
    pub coinbase_inputs: u64,
    pub declared_outputs: u64,
    pub zero_value_outputs: u64,
    pub indexed_inputs: u64,
    pub indexed_outputs: u64,
}

impl BlockTotals {
    /// Returns `true` if every declared child row is present.
    pub fn is_consistent(&self, num_tx: u64) -> bool {
        self.tx_rows == num_tx
            && self.indexed_inputs == self.declared_inputs.saturating_sub(self.coinbase_inputs)
            && self.indexed_outputs
                == self.declared_outputs.saturating_sub(self.zero_value_outputs)
    }
}

/// Snapshot used for periodic progress logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub unprocessed_inputs: u64,
}

impl SyncProgress {
    pub fn verified_percent(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.verified_blocks as f64 * 100.0 / self.total_blocks as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_status_transitions() {
        use ProcessStatus::*;
        assert!(NoStart.can_transition_to(Downloading));
        assert!(Downloaded.can_transition_to(Processing));
        assert!(Completed.can_transition_to(DoubleCheck));
        assert!(DoubleCheck.can_transition_to(NoStart));
        assert!(!NoStart.can_transition_to(Completed));
        assert!(!Downloading.can_transition_to(Processing));
        assert!(DoubleCheck.transition(Processing).is_err());
    }

    #[test]
    fn process_status_codes() {
        for status in [
            ProcessStatus::NoStart,
            ProcessStatus::Downloading,
            ProcessStatus::Downloaded,
            ProcessStatus::Processing,
            ProcessStatus::Completed,
            ProcessStatus::DoubleCheck,
        ] {
            assert_eq!(ProcessStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(ProcessStatus::from_code(9).is_err());
    }

    #[test]
    fn token_check_is_terminal() {
        assert!(TokenCheck::Uncheck.transition(TokenCheck::Failed).is_ok());
        assert!(TokenCheck::Passed.transition(TokenCheck::Failed).is_err());
        assert!(TokenCheck::Failed.transition(TokenCheck::Uncheck).is_err());
    }

    #[test]
    fn notify_status_forward_only() {
        assert!(NotifyStatus::NoStart.transition(NotifyStatus::ShouldNotify).is_ok());
        assert!(NotifyStatus::ShouldNotify.transition(NotifyStatus::Completed).is_ok());
        assert!(NotifyStatus::Completed.transition(NotifyStatus::NoStart).is_err());
    }

    #[test]
    fn outpoint_keys() {
        let key = outpoint_key("ab", 3);
        assert_eq!(key, "ab_3");
        assert_eq!(split_outpoint(&key), Some(("ab", 3)));
        assert_eq!(split_outpoint("nounderscore"), None);
    }

    #[test]
    fn tx_completeness() {
        let tx = TxRecord {
            txid: "t".into(),
            block_hash: None,
            tx_in_num: 1,
            tx_in_coinbase: 1,
            tx_out_num: 3,
            tx_out_zero_value: 1,
            is_completed_check: false,
            is_deleted: false,
            notify_status: NotifyStatus::NoStart,
            cursor_id: 0,
            created_at: 0,
        };
        assert!(tx.is_complete(ChildCounts { inputs: 0, outputs: 2 }));
        assert!(!tx.is_complete(ChildCounts { inputs: 0, outputs: 3 }));
    }

    #[test]
    fn header_deserializes_from_rpc_json() {
        let json = serde_json::json!({
            "hash": "00aa",
            "confirmations": 1,
            "height": 7,
            "version": 536870912,
            "versionHex": "20000000",
            "merkleroot": "11bb",
            "num_tx": 2,
            "time": 1700000000,
            "mediantime": 1699999000,
            "nonce": 42,
            "bits": "1d00ffff",
            "difficulty": 1.5,
            "chainwork": "00ff",
            "previousblockhash": "0099"
        });
        let header: BlockHeader = serde_json::from_value(json).unwrap();
        let record = BlockRecord::from_header(&header);
        assert_eq!(record.prev_hash.as_deref(), Some("0099"));
        assert_eq!(record.num_tx, 2);
        assert_eq!(record.process_status, ProcessStatus::NoStart);
    }
}
