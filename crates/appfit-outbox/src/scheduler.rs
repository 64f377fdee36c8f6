//! Recurring background jobs bound to an owner.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Broadcast stop signal shared by every task of one owner.
#[derive(Debug)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Receiver for a task that should stop when the signal fires.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

/// A job that runs every `interval` until shut down.
///
/// The delay is re-armed after each run finishes, whatever the job's outcome,
/// so runs never overlap. A job already running when the signal fires is
/// allowed to finish. Dropping the task aborts it.
pub struct RecurringTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl RecurringTask {
    /// Spawn `job` on `runtime`.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        runtime: &Handle,
        mut shutdown: watch::Receiver<bool>,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = runtime.spawn(async move {
            debug!(task = name, interval_ms = interval.as_millis() as u64, "Recurring task started");

            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            // Owner dropped the signal without firing it.
                            break;
                        }
                    }
                    _ = sleep(interval) => {
                        job().await;
                    }
                }
            }

            debug!(task = name, "Recurring task stopped");
        });

        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Wait for the loop to exit after the shutdown signal fired.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(task = self.name, error = %e, "Recurring task panicked");
                }
            }
        }
        info!(task = self.name, "Recurring task joined");
    }

    /// Stop immediately, abandoning a run in progress.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.abort();
    }
}
