//! utxoindex-node — full-node transport for UtxoIndex.
//!
//! Implements the core `NodeClient` and `EventSource` traits:
//!
//! - [`NodeRpcClient`]: JSON-RPC 1.0, REST raw transactions and chunked
//!   block downloads, with retry and backoff
//! - [`ChannelEventSource`]: broadcast feed for raw-tx / hash-block events
//! - [`NodePoller`]: fills that feed by polling nodes without a push feed
//!
//! # Usage
//! ```rust,no_run
//! use utxoindex_node::{NodeConfig, NodeRpcClient};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::from_hosts("127.0.0.1", 9882, "127.0.0.1", 9883, "user", "pass");
//! let client = NodeRpcClient::new(config)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod loader;
pub mod poller;
pub mod request;
pub mod retry;

pub use client::NodeRpcClient;
pub use config::NodeConfig;
pub use error::TransportError;
pub use events::ChannelEventSource;
pub use loader::ObjectLoader;
pub use poller::{NodePoller, PollReport};
pub use retry::{RetryConfig, RetryPolicy};
