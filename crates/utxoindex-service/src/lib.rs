//! utxoindex-service — runs the UtxoIndex pipeline as a set of
//! long-lived tasks.
//!
//! ```text
//! chain-tip ─► block-download ─► block-decompose ─► block-batch
//! events ─► mempool                                 spend-marking
//! completeness · mempool-timeout · mempool-sync · double-check
//! spend-repair · progress · token-verify
//! ```
//!
//! Each task is a [`run_periodic`] loop sharing one [`Shutdown`] signal.

pub mod builder;
pub mod daemon;
pub mod service;

pub use builder::IndexerBuilder;
pub use daemon::{run_periodic, run_woken, Pace, Shutdown};
pub use service::{IndexerService, ServiceHandle};
