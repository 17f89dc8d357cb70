//! The assembled indexer: every pipeline component plus the tasks that
//! drive it.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use utxoindex_core::{
    BlockCache, BlockDecomposer, BlockFetcher, ChainTipTracker, EventSource, HandlerRegistry,
    IndexStore, IndexerConfig, IndexerError, NodeClient, NodeEvent, Reconciler, TokenVerifier,
    TxIndexer,
};

use crate::daemon::{run_periodic, run_woken, Pace, Shutdown};

/// Delay before resubscribing to a dropped event feed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);

pub struct IndexerService {
    config: IndexerConfig,
    store: Arc<dyn IndexStore>,
    events: Option<Arc<dyn EventSource>>,
    tracker: Arc<ChainTipTracker>,
    fetcher: Arc<BlockFetcher>,
    decomposer: Arc<BlockDecomposer>,
    indexer: Arc<TxIndexer>,
    reconciler: Arc<Reconciler>,
    verifier: Arc<TokenVerifier>,
    new_block: Arc<Notify>,
    shutdown: Shutdown,
}

impl IndexerService {
    /// Wire every component. Opens (and creates) the block cache directory.
    pub async fn new(
        config: IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
        events: Option<Arc<dyn EventSource>>,
        handlers: HandlerRegistry,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let cache = Arc::new(BlockCache::open(config.block_cache_dir.clone()).await?);
        let handlers = Arc::new(handlers);

        let tracker = Arc::new(ChainTipTracker::new(&config, store.clone(), node.clone(), handlers.clone()));
        let fetcher = Arc::new(BlockFetcher::new(&config, store.clone(), node.clone(), cache.clone()));
        let indexer = Arc::new(TxIndexer::new(&config, store.clone(), node.clone(), cache.clone(), handlers));
        let decomposer = Arc::new(BlockDecomposer::new(&config, store.clone(), cache, indexer.clone()));
        let reconciler = Arc::new(Reconciler::new(&config, store.clone(), node, indexer.clone()));
        let verifier = Arc::new(TokenVerifier::new(&config, store.clone()));

        Ok(Self {
            config,
            store,
            events,
            tracker,
            fetcher,
            decomposer,
            indexer,
            reconciler,
            verifier,
            new_block: Arc::new(Notify::new()),
            shutdown: Shutdown::new(),
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn indexer(&self) -> &Arc<TxIndexer> {
        &self.indexer
    }

    /// Handle that stops every loop when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Finish blocks a previous run left in `Processing`, then spawn every
    /// loop. Returns once the tasks are running.
    pub async fn start(&self) -> Result<ServiceHandle, IndexerError> {
        let resumed = self.decomposer.resume_pending().await?;
        if resumed.blocks > 0 {
            tracing::info!(
                blocks = resumed.blocks,
                queued = resumed.queued,
                reset = resumed.reset,
                "pending blocks resumed"
            );
        }

        let mut tasks = JoinSet::new();
        self.spawn_block_loops(&mut tasks);
        self.spawn_tx_loops(&mut tasks);
        self.spawn_reconcile_loops(&mut tasks);

        if let Some(source) = &self.events {
            tasks.spawn(consume_events(
                source.clone(),
                self.indexer.clone(),
                self.new_block.clone(),
                self.shutdown.clone(),
            ));
        }

        tracing::info!(tasks = tasks.len(), "indexer started");
        Ok(ServiceHandle {
            shutdown: self.shutdown.clone(),
            tasks,
        })
    }

    /// Start, then block until the shutdown handle fires and every task
    /// has stopped.
    pub async fn run(self) -> Result<(), IndexerError> {
        let handle = self.start().await?;
        self.shutdown.wait().await;
        handle.join().await;
        Ok(())
    }

    fn spawn<F, Fut>(&self, tasks: &mut JoinSet<()>, name: &'static str, interval: Duration, step: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Pace, IndexerError>> + Send + 'static,
    {
        tasks.spawn(run_periodic(name, interval, self.shutdown.clone(), step));
    }

    fn spawn_block_loops(&self, tasks: &mut JoinSet<()>) {
        let tracker = self.tracker.clone();
        tasks.spawn(run_woken(
            "chain-tip",
            self.config.chain_tip_interval(),
            self.new_block.clone(),
            self.shutdown.clone(),
            move || {
                let tracker = tracker.clone();
                async move {
                    tracker.run_pass().await?;
                    Ok(Pace::Idle)
                }
            },
        ));

        let fetcher = self.fetcher.clone();
        self.spawn(tasks, "block-download", self.config.download_interval(), move || {
            let fetcher = fetcher.clone();
            async move {
                fetcher.run_pass().await?;
                Ok(Pace::Idle)
            }
        });

        let decomposer = self.decomposer.clone();
        self.spawn(tasks, "block-decompose", self.config.decompose_interval(), move || {
            let decomposer = decomposer.clone();
            async move {
                let report = decomposer.run_pass().await?;
                if report.blocks > 0 {
                    tracing::debug!(
                        blocks = report.blocks,
                        queued = report.queued,
                        completed = report.completed,
                        reset = report.reset,
                        failed = report.failed,
                        "decomposer pass"
                    );
                }
                Ok(Pace::Idle)
            }
        });
    }

    fn spawn_tx_loops(&self, tasks: &mut JoinSet<()>) {
        let indexer = self.indexer.clone();
        self.spawn(tasks, "block-batch", self.config.tx_process_interval(), move || {
            let indexer = indexer.clone();
            async move {
                let written = indexer.flush_block_batches().await?;
                Ok(if written > 0 { Pace::Busy } else { Pace::Idle })
            }
        });

        let indexer = self.indexer.clone();
        self.spawn(tasks, "mempool", self.config.tx_process_interval(), move || {
            let indexer = indexer.clone();
            async move {
                let written = indexer.drain_mempool().await?;
                Ok(if written > 0 { Pace::Busy } else { Pace::Idle })
            }
        });

        let indexer = self.indexer.clone();
        let cursor = Arc::new(AtomicI64::new(0));
        self.spawn(tasks, "spend-marking", self.config.spend_interval(), move || {
            let indexer = indexer.clone();
            let cursor = cursor.clone();
            async move {
                let next = indexer.mark_spent(cursor.load(Ordering::Relaxed)).await?;
                cursor.store(next, Ordering::Relaxed);
                Ok(if next > 0 { Pace::Busy } else { Pace::Idle })
            }
        });
    }

    fn spawn_reconcile_loops(&self, tasks: &mut JoinSet<()>) {
        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "completeness", self.config.completeness_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.completeness_sweep().await?;
                Ok(Pace::Idle)
            }
        });

        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "mempool-timeout", self.config.timeout_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.timeout_sweep(chrono::Utc::now().timestamp()).await?;
                Ok(Pace::Idle)
            }
        });

        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "mempool-sync", self.config.mempool_sync_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.sync_mempool().await?;
                Ok(Pace::Idle)
            }
        });

        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "double-check", self.config.double_check_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.double_check_blocks().await?;
                Ok(Pace::Idle)
            }
        });

        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "spend-repair", self.config.spend_repair_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.repair_spend_flags().await?;
                Ok(Pace::Idle)
            }
        });

        let reconciler = self.reconciler.clone();
        self.spawn(tasks, "progress", self.config.progress_interval(), move || {
            let reconciler = reconciler.clone();
            async move {
                reconciler.report_progress().await?;
                Ok(Pace::Idle)
            }
        });

        let verifier = self.verifier.clone();
        let page = self.config.verify_batch;
        self.spawn(tasks, "token-verify", self.config.verify_idle(), move || {
            let verifier = verifier.clone();
            async move {
                let report = verifier.run_pass().await?;
                Ok(if report.scanned >= page { Pace::Busy } else { Pace::Idle })
            }
        });
    }
}

/// Running tasks of a started service.
pub struct ServiceHandle {
    shutdown: Shutdown,
    tasks: JoinSet<()>,
}

impl ServiceHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop and wait for them to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        self.join().await;
    }

    /// Wait for every task to finish.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "indexer task panicked");
            }
        }
        tracing::info!("indexer stopped");
    }
}

/// Feed raw mempool transactions into the indexer queue and wake the
/// chain-tip loop on new blocks. Resubscribes whenever the feed drops.
async fn consume_events(
    source: Arc<dyn EventSource>,
    indexer: Arc<TxIndexer>,
    new_block: Arc<Notify>,
    shutdown: Shutdown,
) {
    while !shutdown.is_triggered() {
        match source.subscribe().await {
            Ok(mut events) => loop {
                tokio::select! {
                    _ = shutdown.wait() => return,
                    event = events.next() => match event {
                        Some(NodeEvent::RawTx(raw)) => indexer.enqueue_raw(raw),
                        Some(NodeEvent::HashBlock(hash)) => {
                            tracing::debug!(block = %hash, "new block announced");
                            new_block.notify_one();
                        }
                        None => {
                            tracing::warn!("node event feed closed, resubscribing");
                            break;
                        }
                    },
                }
            },
            Err(e) => tracing::warn!(error = %e, "node event subscription failed"),
        }
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}
