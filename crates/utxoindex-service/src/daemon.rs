//! Loop runner and shutdown signal.
//!
//! Every pipeline component runs as its own task: call the step, log a
//! failure at `warn`, wait, repeat. A step that reports more work pending
//! runs again right away; an idle step sleeps for the loop's interval or
//! until it is woken.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use utxoindex_core::IndexerError;

/// Cloneable stop signal shared by every loop.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called (immediately if it already was).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// What a loop should do after a successful step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// More work is pending: run the step again immediately.
    Busy,
    /// Nothing left: wait for the interval.
    Idle,
}

/// Run `step` until `shutdown` fires.
pub async fn run_periodic<F, Fut>(name: &'static str, interval: Duration, shutdown: Shutdown, step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Pace, IndexerError>>,
{
    run_loop(name, interval, None, shutdown, step).await
}

/// Like [`run_periodic`], but an idle wait also ends when `wake` is notified.
pub async fn run_woken<F, Fut>(
    name: &'static str,
    interval: Duration,
    wake: Arc<Notify>,
    shutdown: Shutdown,
    step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Pace, IndexerError>>,
{
    run_loop(name, interval, Some(wake), shutdown, step).await
}

async fn run_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    wake: Option<Arc<Notify>>,
    shutdown: Shutdown,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Pace, IndexerError>>,
{
    tracing::debug!(task = name, interval_ms = interval.as_millis() as u64, "loop started");
    while !shutdown.is_triggered() {
        let pace = match step().await {
            Ok(pace) => pace,
            Err(e) => {
                tracing::warn!(task = name, error = %e, transient = e.is_transient(), "loop step failed");
                Pace::Idle
            }
        };
        if pace == Pace::Busy {
            tokio::task::yield_now().await;
            continue;
        }
        let woken = async {
            match &wake {
                Some(notify) => notify.notified().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(interval) => {}
            _ = woken => tracing::trace!(task = name, "loop woken"),
        }
    }
    tracing::debug!(task = name, "loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn shutdown_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
        // already triggered: returns at once
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn failing_steps_keep_the_loop_alive() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            tokio::spawn(run_periodic("test", Duration::from_millis(1), shutdown.clone(), move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Pace, _>(IndexerError::Rpc("down".into()))
                }
            }))
        };
        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_steps_repeat_without_waiting() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            let shutdown_in_step = shutdown.clone();
            tokio::spawn(run_periodic("test", Duration::from_secs(3600), shutdown.clone(), move || {
                let calls = calls.clone();
                let shutdown = shutdown_in_step.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 4 {
                        shutdown.trigger();
                    }
                    Ok(Pace::Busy)
                }
            }))
        };
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("busy loop should not sleep")
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn notify_wakes_an_idle_loop() {
        let shutdown = Shutdown::new();
        let wake = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            tokio::spawn(run_woken("test", Duration::from_secs(3600), wake.clone(), shutdown.clone(), move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Pace::Idle)
                }
            }))
        };
        while calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wake.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("notify should wake the loop");
        shutdown.trigger();
        task.await.unwrap();
    }
}
