//! Configuration for the `utxoindex` binary.
//!
//! Defaults, then an optional JSON file, then environment variables; later
//! sources win.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use utxoindex_core::IndexerConfig;
use utxoindex_node::NodeConfig;

/// `DATABASE_URL` value that selects the in-memory store.
pub const MEMORY_DATABASE: &str = "memory";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9882;
const DEFAULT_EXT_PORT: u16 = 9883;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub indexer: IndexerConfig,
    pub node: NodeConfig,
    /// SQLite file path or `sqlite:` URL, or `memory`.
    pub database_url: String,
    /// Poll the node for new blocks and mempool transactions.
    pub poll_events: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            indexer: IndexerConfig::default(),
            node: NodeConfig::default(),
            database_url: "sqlite://utxoindex.db".into(),
            poll_events: true,
        }
    }
}

impl Settings {
    /// Load from an optional JSON file and the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings
            .indexer
            .validate()
            .context("invalid indexer configuration")?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Override fields from environment variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let rpc_host = var("RPC_HOST");
        let rpc_port = parse_var::<u16>(&var, "RPC_PORT")?;
        let ext_host = var("RPC_EXT_HOST");
        let ext_port = parse_var::<u16>(&var, "RPC_EXT_PORT")?;
        let hosts = NodeConfig::from_hosts(
            rpc_host.as_deref().unwrap_or(DEFAULT_HOST),
            rpc_port.unwrap_or(DEFAULT_RPC_PORT),
            ext_host.as_deref().unwrap_or(DEFAULT_HOST),
            ext_port.unwrap_or(DEFAULT_EXT_PORT),
            "",
            "",
        );
        if rpc_host.is_some() || rpc_port.is_some() {
            self.node.rpc_url = hosts.rpc_url;
        }
        if ext_host.is_some() || ext_port.is_some() {
            self.node.object_url = hosts.object_url;
        }
        if let Some(user) = var("RPC_USER") {
            self.node.user = user;
        }
        if let Some(password) = var("RPC_PASSWORD") {
            self.node.password = password;
        }

        if let Some(ms) = parse_var(&var, "BLOCK_TIME_MS")? {
            self.indexer.chain_tip_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&var, "BLOCK_DOWNLOAD_MS")? {
            self.indexer.download_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&var, "TX_PROCESS_MS")? {
            self.indexer.tx_process_interval_ms = ms;
        }
        if let Some(blocks) = parse_var(&var, "BLOCK_CACHE_NUMBER")? {
            self.indexer.block_cache_size = blocks;
        }
        if let Some(dir) = var("BLOCK_CACHE_FOLDER") {
            self.indexer.block_cache_dir = dir.into();
        }
        if let Some(height) = parse_var(&var, "START_HEIGHT")? {
            self.indexer.start_height = Some(height);
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE
    }

    /// JSON view with the RPC password masked.
    pub fn redacted_json(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.node.password.is_empty() {
            shown.node.password = "***".into();
        }
        Ok(serde_json::to_string_pretty(&shown)?)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{name}={raw:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("RPC_HOST", "10.0.0.5"),
                ("RPC_PORT", "19882"),
                ("RPC_USER", "indexer"),
                ("RPC_PASSWORD", "secret"),
                ("BLOCK_TIME_MS", "2500"),
                ("BLOCK_CACHE_NUMBER", "40"),
                ("BLOCK_CACHE_FOLDER", "/tmp/blocks"),
                ("START_HEIGHT", "80000"),
                ("DATABASE_URL", "memory"),
            ]))
            .unwrap();

        assert_eq!(settings.node.rpc_url, "http://10.0.0.5:19882");
        // object endpoint untouched without RPC_EXT_*
        assert_eq!(settings.node.object_url, NodeConfig::default().object_url);
        assert_eq!(settings.node.user, "indexer");
        assert_eq!(settings.indexer.chain_tip_interval_ms, 2500);
        assert_eq!(settings.indexer.block_cache_size, 40);
        assert_eq!(settings.indexer.block_cache_dir, Path::new("/tmp/blocks"));
        assert_eq!(settings.indexer.start_height, Some(80_000));
        assert!(settings.uses_memory_store());
    }

    #[test]
    fn bad_number_names_the_variable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("RPC_EXT_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("RPC_EXT_PORT"));
    }

    #[test]
    fn file_values_fill_in_and_env_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"indexer": {{"verify_batch": 7, "tx_process_interval_ms": 900}},
                "node": {{"object_url": "http://objects:9000"}},
                "database_url": "/var/lib/utxoindex/index.db"}}"#
        )
        .unwrap();

        let mut settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.indexer.verify_batch, 7);
        assert_eq!(settings.indexer.header_batch, IndexerConfig::default().header_batch);
        assert_eq!(settings.node.object_url, "http://objects:9000");
        assert!(settings.poll_events);

        settings.apply_env(env(&[("TX_PROCESS_MS", "100")])).unwrap();
        assert_eq!(settings.indexer.tx_process_interval_ms, 100);
        assert_eq!(settings.database_url, "/var/lib/utxoindex/index.db");
    }

    #[test]
    fn redacted_json_hides_password() {
        let mut settings = Settings::default();
        settings.node.password = "secret".into();
        let json = settings.redacted_json().unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("***"));
    }
}
