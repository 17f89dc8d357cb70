//! Output script classification and token data extraction.
//!
//! Token outputs follow the MetaContract layout: the final push of the
//! locking script is a data part whose trailing fields are fixed-width and
//! end with the ASCII protocol flag `metacontract`. Everything before that
//! push is the contract code; its HASH160 is the token's code hash.
//!
//! ```text
//! FT  data: name(40) symbol(20) decimal(1) address(20) amount(8)
//!           genesis(20) sensible_id(36) version(4) type(4)=1 flag(12)
//! NFT data: meta_txid(32) meta_index(4) address(20) supply(8) index(8)
//!           genesis(20) sensible_id(36) version(4) type(4)=3 flag(12)
//! ```

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::IndexerError;
use crate::types::{ScriptType, UNKNOWN_ADDRESS};

pub const PROTOCOL_FLAG: &[u8] = b"metacontract";
pub const PROTO_TYPE_FT: u32 = 1;
pub const PROTO_TYPE_NFT: u32 = 3;

const FT_DATA_LEN: usize = 165;
const NFT_DATA_LEN: usize = 148;
const SENSIBLE_ID_LEN: usize = 36;

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_RETURN: u8 = 0x6a;

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

// ─── Decoded output ───────────────────────────────────────────────────────────

/// Fungible-token fields carried by an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtData {
    pub code_hash: String,
    pub genesis: String,
    pub name: String,
    pub symbol: String,
    pub decimal: u8,
    pub address_hex: String,
    pub amount: u64,
    pub sensible_id: String,
}

/// Non-fungible-token fields carried by an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftData {
    pub code_hash: String,
    pub genesis: String,
    pub meta_txid: String,
    pub meta_output_index: u32,
    pub address_hex: String,
    pub token_supply: u64,
    pub token_index: u64,
    pub sensible_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenData {
    Ft(FtData),
    Nft(NftData),
}

/// Result of classifying one locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub script_type: ScriptType,
    /// 20-byte owner hash in hex, or `"unknown"`.
    pub address_hex: String,
    pub token: Option<TokenData>,
}

impl ScriptInfo {
    fn plain(script_type: ScriptType, address_hex: String) -> Self {
        Self {
            script_type,
            address_hex,
            token: None,
        }
    }
}

/// Classify a locking script. Never fails: anything unrecognized is
/// `Unknown` with the `"unknown"` address.
pub fn classify(script: &[u8]) -> ScriptInfo {
    if let Some(hash) = p2pkh_hash(script) {
        return ScriptInfo::plain(ScriptType::P2pkh, hex::encode(hash));
    }
    if let Some(token) = decode_token(script) {
        let (script_type, address_hex) = match &token {
            TokenData::Ft(ft) => (ScriptType::FungibleToken, ft.address_hex.clone()),
            TokenData::Nft(nft) => (ScriptType::NonFungibleToken, nft.address_hex.clone()),
        };
        return ScriptInfo {
            script_type,
            address_hex,
            token: Some(token),
        };
    }
    if script.first() == Some(&OP_RETURN) || script.starts_with(&[0x00, OP_RETURN]) {
        return ScriptInfo::plain(ScriptType::OpReturn, UNKNOWN_ADDRESS.into());
    }
    ScriptInfo::plain(ScriptType::Unknown, UNKNOWN_ADDRESS.into())
}

fn p2pkh_hash(script: &[u8]) -> Option<&[u8]> {
    match script {
        [0x76, 0xa9, 0x14, rest @ ..] if rest.len() == 22 && rest[20..] == [0x88, 0xac] => {
            Some(&rest[..20])
        }
        _ => None,
    }
}

// ─── Token decoding ───────────────────────────────────────────────────────────

/// Offset of the final push opcode and its payload.
fn last_push(script: &[u8]) -> Option<(usize, &[u8])> {
    let mut pos = 0;
    let mut last = None;
    while pos < script.len() {
        let start = pos;
        let op = script[pos];
        pos += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(pos)? as usize;
                pos += 1;
                n
            }
            OP_PUSHDATA2 => {
                let b = script.get(pos..pos + 2)?;
                pos += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = script.get(pos..pos + 4)?;
                pos += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => {
                last = None;
                continue;
            }
        };
        let data = script.get(pos..pos.checked_add(len)?)?;
        pos += len;
        last = Some((start, data));
    }
    last
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    u64::from_le_bytes(out)
}

fn text_field(b: &[u8]) -> String {
    let end = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

fn reversed_hex(b: &[u8]) -> String {
    let mut v = b.to_vec();
    v.reverse();
    hex::encode(v)
}

fn decode_token(script: &[u8]) -> Option<TokenData> {
    let (code_end, data) = last_push(script)?;
    if !data.ends_with(PROTOCOL_FLAG) || data.len() < 20 + PROTOCOL_FLAG.len() {
        return None;
    }
    let n = data.len();
    let proto_type = read_u32(&data[n - 16..n - 12]);
    let code_hash = hex::encode(hash160(&script[..code_end]));

    match proto_type {
        PROTO_TYPE_FT if n >= FT_DATA_LEN => {
            let d = &data[n - FT_DATA_LEN..];
            Some(TokenData::Ft(FtData {
                code_hash,
                name: text_field(&d[0..40]),
                symbol: text_field(&d[40..60]),
                decimal: d[60],
                address_hex: hex::encode(&d[61..81]),
                amount: read_u64(&d[81..89]),
                genesis: hex::encode(&d[89..109]),
                sensible_id: hex::encode(&d[109..145]),
            }))
        }
        PROTO_TYPE_NFT if n >= NFT_DATA_LEN => {
            let d = &data[n - NFT_DATA_LEN..];
            Some(TokenData::Nft(NftData {
                code_hash,
                meta_txid: reversed_hex(&d[0..32]),
                meta_output_index: read_u32(&d[32..36]),
                address_hex: hex::encode(&d[36..56]),
                token_supply: read_u64(&d[56..64]),
                token_index: read_u64(&d[64..72]),
                genesis: hex::encode(&d[72..92]),
                sensible_id: hex::encode(&d[92..128]),
            }))
        }
        _ => None,
    }
}

// ─── Lineage id ───────────────────────────────────────────────────────────────

/// Returns `true` for the all-zero lineage id carried by issuance outputs.
pub fn is_zero_sensible_id(sensible_id: &str) -> bool {
    sensible_id.len() == SENSIBLE_ID_LEN * 2 && sensible_id.bytes().all(|c| c == b'0')
}

/// Split a lineage id into the genesis txid (display hex) and output index.
pub fn parse_sensible_id(sensible_id: &str) -> Result<(String, u32), IndexerError> {
    let bytes = hex::decode(sensible_id)
        .map_err(|e| IndexerError::Decode(format!("bad sensible id {sensible_id}: {e}")))?;
    if bytes.len() != SENSIBLE_ID_LEN {
        return Err(IndexerError::Decode(format!(
            "sensible id has {} bytes, expected {SENSIBLE_ID_LEN}",
            bytes.len()
        )));
    }
    Ok((reversed_hex(&bytes[..32]), read_u32(&bytes[32..36])))
}

/// Test and fixture helpers for building token scripts.
pub mod build {
    use super::*;

    fn push(out: &mut Vec<u8>, data: &[u8]) {
        match data.len() {
            0..=0x4b => out.push(data.len() as u8),
            0x4c..=0xff => {
                out.push(OP_PUSHDATA1);
                out.push(data.len() as u8);
            }
            _ => {
                out.push(OP_PUSHDATA2);
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            }
        }
        out.extend_from_slice(data);
    }

    fn fixed(text: &str, width: usize) -> Vec<u8> {
        let mut v = text.as_bytes().to_vec();
        v.resize(width, 0);
        v
    }

    /// Standard P2PKH locking script for a 20-byte hash.
    pub fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut out = vec![0x76, 0xa9, 0x14];
        out.extend_from_slice(&hash);
        out.extend_from_slice(&[0x88, 0xac]);
        out
    }

    /// Raw 36-byte lineage id for a genesis outpoint, hex encoded.
    pub fn sensible_id(genesis_txid: &str, index: u32) -> String {
        let mut bytes = hex::decode(genesis_txid).unwrap_or_default();
        bytes.reverse();
        bytes.resize(32, 0);
        bytes.extend_from_slice(&index.to_le_bytes());
        hex::encode(bytes)
    }

    /// A fungible-token locking script: `code` followed by OP_RETURN and the
    /// data push.
    #[allow(clippy::too_many_arguments)]
    pub fn ft_script(
        code: &[u8],
        name: &str,
        symbol: &str,
        decimal: u8,
        address: [u8; 20],
        amount: u64,
        genesis: [u8; 20],
        sensible_id_hex: &str,
    ) -> Vec<u8> {
        let mut data = fixed(name, 40);
        data.extend(fixed(symbol, 20));
        data.push(decimal);
        data.extend_from_slice(&address);
        data.extend_from_slice(&amount.to_le_bytes());
        data.extend_from_slice(&genesis);
        data.extend(hex::decode(sensible_id_hex).unwrap_or_else(|_| vec![0; 36]));
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&PROTO_TYPE_FT.to_le_bytes());
        data.extend_from_slice(PROTOCOL_FLAG);

        let mut out = code.to_vec();
        out.push(OP_RETURN);
        push(&mut out, &data);
        out
    }

    /// A non-fungible-token locking script.
    #[allow(clippy::too_many_arguments)]
    pub fn nft_script(
        code: &[u8],
        meta_txid: &str,
        meta_index: u32,
        address: [u8; 20],
        supply: u64,
        token_index: u64,
        genesis: [u8; 20],
        sensible_id_hex: &str,
    ) -> Vec<u8> {
        let mut meta = hex::decode(meta_txid).unwrap_or_else(|_| vec![0; 32]);
        meta.reverse();
        let mut data = meta;
        data.extend_from_slice(&meta_index.to_le_bytes());
        data.extend_from_slice(&address);
        data.extend_from_slice(&supply.to_le_bytes());
        data.extend_from_slice(&token_index.to_le_bytes());
        data.extend_from_slice(&genesis);
        data.extend(hex::decode(sensible_id_hex).unwrap_or_else(|_| vec![0; 36]));
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&PROTO_TYPE_NFT.to_le_bytes());
        data.extend_from_slice(PROTOCOL_FLAG);

        let mut out = code.to_vec();
        out.push(OP_RETURN);
        push(&mut out, &data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    const CODE: &[u8] = &[0x51, 0x52, 0x93, 0x75];

    #[test]
    fn p2pkh_address() {
        let info = classify(&p2pkh([0xab; 20]));
        assert_eq!(info.script_type, ScriptType::P2pkh);
        assert_eq!(info.address_hex, "ab".repeat(20));
        assert!(info.token.is_none());
    }

    #[test]
    fn op_return_is_unknown_address() {
        let info = classify(&[0x00, 0x6a, 0x03, 1, 2, 3]);
        assert_eq!(info.script_type, ScriptType::OpReturn);
        assert_eq!(info.address_hex, UNKNOWN_ADDRESS);
    }

    #[test]
    fn garbage_is_unknown() {
        let info = classify(&[0x4c]);
        assert_eq!(info.script_type, ScriptType::Unknown);
        assert_eq!(info.address_hex, UNKNOWN_ADDRESS);
    }

    #[test]
    fn fungible_token_fields() {
        let sid = sensible_id(&"aa".repeat(32), 2);
        let script = ft_script(CODE, "Space", "SPC", 8, [0x11; 20], 12_345, [0x22; 20], &sid);
        let info = classify(&script);
        assert_eq!(info.script_type, ScriptType::FungibleToken);
        assert_eq!(info.address_hex, "11".repeat(20));
        let Some(TokenData::Ft(ft)) = info.token else {
            panic!("expected ft");
        };
        assert_eq!(ft.name, "Space");
        assert_eq!(ft.symbol, "SPC");
        assert_eq!(ft.decimal, 8);
        assert_eq!(ft.amount, 12_345);
        assert_eq!(ft.genesis, "22".repeat(20));
        assert_eq!(ft.sensible_id, sid);
        assert_eq!(ft.code_hash, hex::encode(hash160(&[CODE, &[0x6a]].concat())));
    }

    #[test]
    fn code_hash_depends_on_code_only() {
        let a = ft_script(CODE, "A", "A", 0, [1; 20], 1, [2; 20], &"00".repeat(36));
        let b = ft_script(CODE, "B", "B", 2, [3; 20], 9, [2; 20], &"00".repeat(36));
        let (Some(TokenData::Ft(fa)), Some(TokenData::Ft(fb))) = (classify(&a).token, classify(&b).token)
        else {
            panic!("expected two ft outputs");
        };
        assert_eq!(fa.code_hash, fb.code_hash);
    }

    #[test]
    fn non_fungible_token_fields() {
        let meta = "cd".repeat(32);
        let sid = sensible_id(&"ef".repeat(32), 0);
        let script = nft_script(CODE, &meta, 1, [0x33; 20], 100, 7, [0x44; 20], &sid);
        let info = classify(&script);
        assert_eq!(info.script_type, ScriptType::NonFungibleToken);
        let Some(TokenData::Nft(nft)) = info.token else {
            panic!("expected nft");
        };
        assert_eq!(nft.meta_txid, meta);
        assert_eq!(nft.meta_output_index, 1);
        assert_eq!(nft.token_supply, 100);
        assert_eq!(nft.token_index, 7);
        assert_eq!(nft.address_hex, "33".repeat(20));
    }

    #[test]
    fn sensible_id_parsing() {
        let genesis = "0102".repeat(16);
        let sid = sensible_id(&genesis, 5);
        assert_eq!(parse_sensible_id(&sid).unwrap(), (genesis, 5));
        assert!(parse_sensible_id("abcd").is_err());
        assert!(parse_sensible_id("zz").is_err());
        assert!(is_zero_sensible_id(&"0".repeat(72)));
        assert!(!is_zero_sensible_id(&sid));
    }
}
