//! utxoindex-storage — persistent `IndexStore` backends for UtxoIndex.
//!
//! # Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|---------|
//! | `MemoryStore` (core) | always | Tests, ephemeral runs |
//! | `SqliteStore` | `sqlite` (default) | Single-node deployments |
//!
//! # Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use utxoindex_core::IndexStore;
//! use utxoindex_storage::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn IndexStore> = Arc::new(SqliteStore::open("./utxoindex.db").await?);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
