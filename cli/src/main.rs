//! utxoindex CLI — run the chain follower and inspect its configuration.
//!
//! Usage:
//! ```bash
//! # Follow the node, index into SQLite
//! RPC_HOST=127.0.0.1 RPC_USER=u RPC_PASSWORD=p utxoindex run
//!
//! # Same, from a JSON file (environment still overrides it)
//! utxoindex run --config utxoindex.json
//!
//! # Print the effective configuration
//! utxoindex config --config utxoindex.json
//!
//! # Submit a signed transaction to the node
//! utxoindex broadcast 0100000001...
//! ```

mod settings;

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use utxoindex_core::{IndexStore, IndexerConfig, MemoryStore, NodeClient};
use utxoindex_node::{ChannelEventSource, NodeConfig, NodePoller, NodeRpcClient};
use utxoindex_service::{run_periodic, IndexerBuilder, Pace};
use utxoindex_storage::SqliteStore;

use crate::settings::Settings;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "broadcast" => cmd_broadcast(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("utxoindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("utxoindex {}", env!("CARGO_PKG_VERSION"));
    println!("Chain follower and UTXO / token indexer for a full node\n");
    println!("USAGE:");
    println!("    utxoindex <COMMAND> [--config <FILE>]\n");
    println!("COMMANDS:");
    println!("    run        Start indexing until Ctrl-C / SIGTERM");
    println!("    config     Print the effective configuration as JSON");
    println!("    broadcast  Send a raw transaction (hex) to the node");
    println!("    info       Show defaults and supported backends");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("ENVIRONMENT:");
    println!("    RPC_HOST, RPC_PORT           node JSON-RPC / REST endpoint");
    println!("    RPC_EXT_HOST, RPC_EXT_PORT   block object service");
    println!("    RPC_USER, RPC_PASSWORD       RPC credentials");
    println!("    BLOCK_TIME_MS                chain-tip poll interval");
    println!("    BLOCK_DOWNLOAD_MS            block download interval");
    println!("    TX_PROCESS_MS                transaction batch interval");
    println!("    BLOCK_CACHE_NUMBER           blocks downloaded ahead");
    println!("    BLOCK_CACHE_FOLDER           block file directory");
    println!("    DATABASE_URL                 SQLite path / URL, or \"memory\"");
    println!("    START_HEIGHT                 lowest height to backfill");
    println!("    RUST_LOG, LOG_JSON=1         log filter and JSON output");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// First argument that is neither a flag nor a flag's value.
fn positional(args: &[String]) -> Option<&String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            iter.next();
        } else if !arg.starts_with("--") {
            return Some(arg);
        }
    }
    None
}

fn load_settings(args: &[String]) -> Result<Settings> {
    let path = parse_flag(args, "--config");
    Settings::load(path.as_deref().map(Path::new))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn cmd_run(args: &[String]) -> Result<()> {
    init_tracing();
    let settings = load_settings(args)?;

    let store: Arc<dyn IndexStore> = if settings.uses_memory_store() {
        tracing::warn!("using the in-memory store; the index is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let store = SqliteStore::open(&settings.database_url)
            .await
            .with_context(|| format!("opening database {}", settings.database_url))?;
        Arc::new(store)
    };

    let node = Arc::new(NodeRpcClient::new(settings.node.clone()).context("building node client")?);
    match node.blockchain_info().await {
        Ok(info) => tracing::info!(
            chain = %info.chain,
            blocks = info.blocks,
            rpc = %settings.node.rpc_url,
            "connected to node"
        ),
        Err(e) => tracing::warn!(rpc = %settings.node.rpc_url, error = %e, "node not reachable yet"),
    }

    let feed = ChannelEventSource::default();
    let mut builder = IndexerBuilder::new()
        .config(settings.indexer.clone())
        .store(store)
        .node(node.clone());
    if settings.poll_events {
        builder = builder.events(Arc::new(feed.clone()));
    }
    let service = builder.build().await?;
    let shutdown = service.shutdown_handle();

    let poller = settings.poll_events.then(|| {
        let poller = Arc::new(NodePoller::new(
            node.clone(),
            feed,
            settings.indexer.mempool_fetch_concurrency,
        ));
        tokio::spawn(run_periodic(
            "node-poll",
            settings.node.poll_interval(),
            shutdown.clone(),
            move || {
                let poller = poller.clone();
                async move { poller.poll_once().await.map(|_| Pace::Idle) }
            },
        ))
    });

    let signals = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        signals.trigger();
    });

    tracing::info!(
        database = %settings.database_url,
        cache_dir = %settings.indexer.block_cache_dir.display(),
        start_height = ?settings.indexer.start_height,
        "starting indexer"
    );
    service.run().await?;
    if let Some(task) = poller {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "node poller panicked");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn cmd_config(args: &[String]) -> Result<()> {
    let settings = load_settings(args)?;
    println!("{}", settings.redacted_json()?);
    Ok(())
}

async fn cmd_broadcast(args: &[String]) -> Result<()> {
    let raw_hex = positional(args)
        .context("usage: utxoindex broadcast <RAW_TX_HEX> [--config <FILE>]")?;
    let raw = hex::decode(raw_hex.trim()).context("transaction is not valid hex")?;
    let settings = load_settings(args)?;
    let node = NodeRpcClient::new(settings.node).context("building node client")?;
    let txid = node.send_raw_transaction(&raw).await?;
    println!("{txid}");
    Ok(())
}

fn cmd_info() {
    let indexer = IndexerConfig::default();
    let node = NodeConfig::default();
    println!("UtxoIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default node RPC: {}", node.rpc_url);
    println!("  Default block object service: {}", node.object_url);
    println!("  Block chunk size: {} bytes, {} in flight", node.chunk_size, node.chunk_concurrency);
    println!("  Blocks downloaded ahead: {}", indexer.block_cache_size);
    println!("  Chain-tip interval: {} ms", indexer.chain_tip_interval_ms);
    println!("  Mempool retention: {} days", indexer.mempool_retention_secs / 86_400);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Events: node polling (best hash + mempool)");
}
