//! Node endpoint configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Where and how to reach the full node.
///
/// JSON-RPC and `/rest/tx` share `rpc_url`; chunked block objects are served
/// from `object_url`, usually an extension service next to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_url: String,
    pub object_url: String,
    pub user: String,
    pub password: String,
    /// Bytes per `/obj/chunk` request.
    pub chunk_size: u64,
    /// Chunk requests in flight per block download.
    pub chunk_concurrency: usize,
    pub request_timeout_ms: u64,
    /// Block downloads can take far longer than single RPC calls.
    pub chunk_timeout_ms: u64,
    /// Poll interval when events come from `NodePoller`.
    pub poll_interval_ms: u64,
    pub retry: RetryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:9882".into(),
            object_url: "http://127.0.0.1:9883".into(),
            user: String::new(),
            password: String::new(),
            chunk_size: 750_000,
            chunk_concurrency: 3,
            request_timeout_ms: 30_000,
            chunk_timeout_ms: 120_000,
            poll_interval_ms: 2_000,
            retry: RetryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Build from host/port pairs the way deployments pass them.
    pub fn from_hosts(
        rpc_host: &str,
        rpc_port: u16,
        ext_host: &str,
        ext_port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            rpc_url: format!("http://{rpc_host}:{rpc_port}"),
            object_url: format!("http://{ext_host}:{ext_port}"),
            user: user.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `rpc_url` without a trailing slash.
    pub fn rpc_base(&self) -> &str {
        self.rpc_url.trim_end_matches('/')
    }

    pub fn object_base(&self) -> &str {
        self.object_url.trim_end_matches('/')
    }
}
