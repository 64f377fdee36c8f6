//! The outbox: owner of the store, its persistence, and every background task.

use crate::{
    DeliveryOutcome, DomainEvent, DrainOutcome, EventDigester, EventStore, FileIdentityStore,
    HttpTransport, HttpTransportConfig, IdentityProvider, OutboxError, OutboxResult,
    RecurringTask, RetryDrainer, ShutdownSignal, SnapshotFile, Transport,
};
use appfit_config_and_utils::{OutboxConfig, Paths};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Progress of merging the on-disk cache into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Startup restore still running.
    Loading,
    /// Cache merged; checkpoints may overwrite the file.
    Loaded,
    /// Cache could not be read. Each checkpoint retries the restore first.
    Failed,
}

/// Writes checkpoints, but only once the on-disk cache is in the store.
///
/// Saving earlier would replace events that were never restored.
struct Checkpointer {
    store: Arc<EventStore>,
    snapshot_file: Arc<SnapshotFile>,
    state: watch::Sender<CacheState>,
}

impl Checkpointer {
    async fn restore(&self) -> OutboxResult<usize> {
        match self.snapshot_file.restore_into(&self.store).await {
            Ok(inserted) => {
                self.state.send_replace(CacheState::Loaded);
                Ok(inserted)
            }
            Err(e) => {
                self.state.send_replace(CacheState::Failed);
                Err(e)
            }
        }
    }

    /// Save the store. `None` while the startup restore is still running.
    async fn checkpoint(&self) -> OutboxResult<Option<usize>> {
        let state = *self.state.borrow();
        match state {
            CacheState::Loading => return Ok(None),
            CacheState::Failed => {
                self.restore().await?;
                info!(cache = %self.snapshot_file.path().display(), "Event cache readable again");
            }
            CacheState::Loaded => {}
        }
        self.snapshot_file.checkpoint(&self.store).await.map(Some)
    }
}

/// Marks the restore failed if the startup task ends without finishing it.
struct StartupGuard(Arc<Checkpointer>);

impl Drop for StartupGuard {
    fn drop(&mut self) {
        self.0.state.send_if_modified(|state| {
            if *state == CacheState::Loading {
                warn!("Startup task ended before the cache was restored");
                *state = CacheState::Failed;
                true
            } else {
                false
            }
        });
    }
}

/// Buffers events locally and delivers them at least once.
///
/// # Lifecycle
///
/// 1. [`Outbox::start`] restores the on-disk cache in the background and
///    schedules the checkpoint and retry tasks.
/// 2. [`Outbox::digest`] / [`Outbox::identify`] hand work to background tasks
///    and return immediately.
/// 3. [`Outbox::shutdown`] stops the schedule, waits for in-flight work and
///    writes a final checkpoint. Dropping the outbox instead aborts every task
///    it owns without a final checkpoint.
///
/// No checkpoint is written until the cache has been read. If reading fails
/// (anything but a corrupt file), every checkpoint retries the read first.
pub struct Outbox {
    store: Arc<EventStore>,
    checkpointer: Arc<Checkpointer>,
    digester: EventDigester,
    drainer: Arc<RetryDrainer>,
    shutdown: ShutdownSignal,
    startup: Option<JoinHandle<()>>,
    tasks: Vec<RecurringTask>,
}

impl Outbox {
    /// Start an outbox with the HTTP collector and the identity file under `paths`.
    pub async fn open(config: &OutboxConfig, paths: &Paths, api_key: &str) -> OutboxResult<Self> {
        config.validate()?;
        let transport = HttpTransport::new(HttpTransportConfig::from(config), api_key)?;
        let identity = FileIdentityStore::open(paths.identity_file()).await;
        Self::start(config, paths, Arc::new(transport), Arc::new(identity))
    }

    /// Start an outbox on the current tokio runtime.
    pub fn start(
        config: &OutboxConfig,
        paths: &Paths,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> OutboxResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| OutboxError::Task(format!("no tokio runtime: {}", e)))?;
        Self::start_on(config, paths, transport, identity, runtime)
    }

    /// Start an outbox whose tasks run on `runtime`.
    ///
    /// May be called from outside the runtime.
    pub fn start_on(
        config: &OutboxConfig,
        paths: &Paths,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        runtime: Handle,
    ) -> OutboxResult<Self> {
        config.validate()?;

        let store = Arc::new(EventStore::new());
        let snapshot_file = Arc::new(SnapshotFile::new(paths.cache_file()));
        let digester = EventDigester::new(
            store.clone(),
            transport.clone(),
            identity.clone(),
            config.send_timeout(),
            runtime.clone(),
        );
        let drainer = Arc::new(RetryDrainer::new(
            store.clone(),
            transport,
            identity.clone(),
            config.send_timeout(),
        ));
        let shutdown = ShutdownSignal::new();
        let (state, _) = watch::channel(CacheState::Loading);
        let checkpointer = Arc::new(Checkpointer {
            store: store.clone(),
            snapshot_file,
            state,
        });

        let startup = {
            let guard = StartupGuard(checkpointer.clone());
            runtime.spawn(async move {
                identity.generate_anonymous_id().await;
                if let Err(e) = guard.0.restore().await {
                    warn!(
                        cache = %guard.0.snapshot_file.path().display(),
                        error = %e,
                        "Failed to read event cache; checkpoints paused until it can be read"
                    );
                }
            })
        };

        let checkpoint = {
            let checkpointer = checkpointer.clone();
            RecurringTask::spawn(
                "checkpoint",
                config.checkpoint_interval(),
                &runtime,
                shutdown.subscribe(),
                move || {
                    let checkpointer = checkpointer.clone();
                    async move {
                        match checkpointer.checkpoint().await {
                            Ok(Some(_)) => {}
                            Ok(None) => debug!("Skipping checkpoint until the cache is restored"),
                            Err(e) => warn!(
                                recoverable = e.is_recoverable(),
                                error = %e,
                                "Checkpoint failed; retrying next interval"
                            ),
                        }
                    }
                },
            )
        };

        let retry = {
            let drainer = drainer.clone();
            RecurringTask::spawn(
                "retry",
                config.retry_interval(),
                &runtime,
                shutdown.subscribe(),
                move || {
                    let drainer = drainer.clone();
                    async move {
                        drainer.drain_once().await;
                    }
                },
            )
        };

        info!(
            cache = %checkpointer.snapshot_file.path().display(),
            checkpoint_secs = config.checkpoint_interval_secs,
            retry_secs = config.retry_interval_secs,
            "Outbox started"
        );

        Ok(Self {
            store,
            checkpointer,
            digester,
            drainer,
            shutdown,
            startup: Some(startup),
            tasks: vec![checkpoint, retry],
        })
    }

    /// Deliver `event` in the background; it is cached if delivery fails.
    pub fn digest(&self, event: DomainEvent) {
        self.digester.digest(event);
    }

    /// Set (or clear, with `None`) the authenticated user in the background.
    pub fn identify(&self, user_id: Option<String>) {
        self.digester.identify(user_id);
    }

    /// Deliver `event` on the caller's task.
    pub async fn deliver(&self, event: DomainEvent) -> DeliveryOutcome {
        self.digester.deliver(event).await
    }

    /// Run a drain cycle now, outside the retry schedule.
    pub async fn drain_now(&self) -> DrainOutcome {
        self.drainer.drain_once().await
    }

    /// Write a checkpoint now, outside the schedule.
    ///
    /// Fails without touching the file if the cache still cannot be read.
    pub async fn checkpoint_now(&self) -> OutboxResult<usize> {
        self.ready().await;
        // Never `None` once `ready` has returned.
        Ok(self.checkpointer.checkpoint().await?.unwrap_or_default())
    }

    /// Wait until the startup attempt to read the on-disk cache has finished.
    pub async fn ready(&self) {
        let mut state = self.checkpointer.state.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = state.wait_for(|state| *state != CacheState::Loading).await;
    }

    /// Wait for every digest and identify call made so far.
    pub async fn wait_idle(&self) {
        self.digester.wait_idle().await;
    }

    /// Number of events waiting for a drain.
    pub async fn pending_count(&self) -> usize {
        self.store.len().await
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Stop all scheduled work, finish in-flight deliveries and checkpoint.
    pub async fn shutdown(mut self) -> OutboxResult<()> {
        self.shutdown.trigger();

        if let Some(startup) = self.startup.take() {
            if let Err(e) = startup.await {
                warn!(error = %e, "Cache restore task did not complete");
            }
        }

        for task in std::mem::take(&mut self.tasks) {
            task.join().await;
        }

        debug!(in_flight = self.digester.in_flight(), "Waiting for in-flight deliveries");
        self.digester.wait_idle().await;

        let saved = self.checkpoint_now().await?;
        info!(pending = saved, "Outbox shut down");
        Ok(())
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(startup) = self.startup.take() {
            startup.abort();
        }
        self.digester.abort_all();
        // Remaining RecurringTasks abort on their own drop.
    }
}
