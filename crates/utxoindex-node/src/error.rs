//! Transport-level error types.

use thiserror::Error;

use utxoindex_core::IndexerError;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to the node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success HTTP status without a JSON-RPC error body.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// JSON-RPC error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node does not have the requested object.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A chunk came back shorter than requested.
    #[error("Short chunk {index}: expected {expected} bytes, got {got}")]
    ShortChunk { index: u64, expected: u64, got: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Payload was not valid hex.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout { .. } | Self::ShortChunk { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Map a failure of the REST/object interface into the pipeline error.
    pub fn into_rest(self) -> IndexerError {
        match self {
            Self::Io(e) => IndexerError::Io(e),
            Self::Decode(msg) => IndexerError::Decode(msg),
            other => IndexerError::Rest(other.to_string()),
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            Self::Timeout { ms: timeout_ms }
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<TransportError> for IndexerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => IndexerError::Io(e),
            TransportError::Decode(msg) => IndexerError::Decode(msg),
            other => IndexerError::Rpc(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Http("reset".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 10 }.is_retryable());
        assert!(TransportError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!TransportError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!TransportError::NotFound("00ab".into()).is_retryable());
        let rpc = TransportError::Rpc(JsonRpcError {
            code: -5,
            message: "No such mempool transaction".into(),
            data: None,
        });
        assert!(!rpc.is_retryable());
    }

    #[test]
    fn maps_into_pipeline_errors() {
        let err: IndexerError = TransportError::Timeout { ms: 5 }.into();
        assert!(matches!(err, IndexerError::Rpc(_)));
        assert!(err.is_transient());

        let err = TransportError::NotFound("00ab".into()).into_rest();
        assert!(matches!(err, IndexerError::Rest(_)));

        let err: IndexerError = TransportError::Decode("odd length".into()).into();
        assert!(err.is_integrity());
    }
}
