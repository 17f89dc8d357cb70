//! Error types for the utxoindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("REST error: {0}")]
    Rest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Merkle root mismatch in block {block_hash}: header {expected}, computed {actual}")]
    MerkleMismatch {
        block_hash: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for failures that are expected to clear on their own
    /// (node unreachable, database busy, short read).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::Rest(_) | Self::Storage(_) | Self::Io(_)
        )
    }

    /// Returns `true` if the error means stored or fetched data failed an
    /// integrity check and the owning record should be reset.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::MerkleMismatch { .. } | Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(IndexerError::Rpc("timeout".into()).is_transient());
        assert!(IndexerError::Storage("locked".into()).is_transient());
        assert!(!IndexerError::Decode("short".into()).is_transient());
        assert!(IndexerError::Decode("short".into()).is_integrity());
        assert!(!IndexerError::Config("missing".into()).is_integrity());
    }
}
