//! Send-on-produce delivery.

use crate::transport::send_with_timeout;
use crate::{DomainEvent, EventStore, IdentityContext, IdentityProvider, Transport, WireEvent};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledged; any cached copy was removed.
    Delivered,
    /// Failed; the event is in the store awaiting the next drain.
    Cached,
}

/// One `identify` call, numbered in call order.
#[derive(Debug, Clone)]
struct UserUpdate {
    seq: u64,
    user_id: Option<String>,
}

/// Identify calls issued but not yet applied by the identity worker.
#[derive(Debug, Default)]
struct UserUpdates {
    issued: u64,
    /// Latest update not yet applied.
    pending: Option<UserUpdate>,
}

/// Collaborators a delivery attempt needs. Shared with every digest task.
struct Delivery {
    store: Arc<EventStore>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    send_timeout: Duration,
    users: Mutex<UserUpdates>,
}

impl Delivery {
    async fn deliver(&self, event: DomainEvent) -> DeliveryOutcome {
        let identity = self.context().await;
        let wire = WireEvent::from_domain(&event, &identity);

        match send_with_timeout(self.send_timeout, self.transport.send(&wire)).await {
            Ok(()) => {
                // Covers a copy cached by an earlier failed attempt.
                if self.store.remove(&event.id).await {
                    debug!(event_id = %event.id, "Delivered previously cached event");
                } else {
                    debug!(event_id = %event.id, "Delivered event");
                }
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                if e.is_recoverable() {
                    warn!(
                        event_id = %event.id,
                        name = %event.name,
                        error = %e,
                        "Event delivery failed, caching for retry"
                    );
                } else {
                    error!(
                        event_id = %event.id,
                        name = %event.name,
                        error = %e,
                        "Event delivery failed unexpectedly, caching for retry"
                    );
                }
                self.store.add(event).await;
                DeliveryOutcome::Cached
            }
        }
    }

    /// Identity as of the latest `identify` call, applied or not.
    async fn context(&self) -> IdentityContext {
        // Read the queue before the provider: once it is empty, every update
        // has already reached the provider.
        let pending = self.lock_users().pending.as_ref().map(|u| u.user_id.clone());
        let mut context = self.identity.context().await;
        if let Some(user_id) = pending {
            context.user_id = user_id;
        }
        context
    }

    fn lock_users(&self) -> MutexGuard<'_, UserUpdates> {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies identify calls to the provider one at a time, in call order.
async fn run_identity_worker(
    delivery: Arc<Delivery>,
    mut updates: mpsc::UnboundedReceiver<UserUpdate>,
    applied: watch::Sender<u64>,
) {
    while let Some(UserUpdate { seq, user_id }) = updates.recv().await {
        delivery.identity.save_user_id(user_id).await;
        {
            let mut users = delivery.lock_users();
            if users.pending.as_ref().is_some_and(|u| u.seq == seq) {
                users.pending = None;
            }
        }
        applied.send_replace(seq);
    }
    debug!("Identity worker stopped");
}

/// Takes in events and handles sending, caching and identity updates.
///
/// `digest` and `identify` return immediately. Digests run concurrently on
/// tasks owned by the digester. Identify calls reach the identity provider in
/// call order through a single worker, and a digest issued after `identify`
/// already carries the new user id. Dropping the digester aborts whatever is
/// still running.
pub struct EventDigester {
    delivery: Arc<Delivery>,
    runtime: Handle,
    tasks: Mutex<JoinSet<()>>,
    identity_tx: mpsc::UnboundedSender<UserUpdate>,
    identity_applied: watch::Receiver<u64>,
    identity_worker: JoinHandle<()>,
}

impl EventDigester {
    /// Create a digester whose tasks run on `runtime`.
    pub fn new(
        store: Arc<EventStore>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        send_timeout: Duration,
        runtime: Handle,
    ) -> Self {
        let delivery = Arc::new(Delivery {
            store,
            transport,
            identity,
            send_timeout,
            users: Mutex::new(UserUpdates::default()),
        });
        let (identity_tx, identity_rx) = mpsc::unbounded_channel();
        let (applied_tx, identity_applied) = watch::channel(0);
        let identity_worker =
            runtime.spawn(run_identity_worker(delivery.clone(), identity_rx, applied_tx));

        Self {
            delivery,
            runtime,
            tasks: Mutex::new(JoinSet::new()),
            identity_tx,
            identity_applied,
            identity_worker,
        }
    }

    /// Send `event` in the background, caching it on failure.
    pub fn digest(&self, event: DomainEvent) {
        let delivery = self.delivery.clone();
        self.spawn(async move {
            delivery.deliver(event).await;
        });
    }

    /// Forward a user id (or logout) to the identity provider in the background.
    pub fn identify(&self, user_id: Option<String>) {
        let mut users = self.delivery.lock_users();
        users.issued += 1;
        let update = UserUpdate {
            seq: users.issued,
            user_id,
        };
        users.pending = Some(update.clone());
        // Sent under the lock so the queue order matches `seq`.
        if self.identity_tx.send(update).is_err() {
            warn!("Identity worker stopped; user id update dropped");
        }
    }

    /// Send `event` and reconcile the store, on the caller's task.
    pub async fn deliver(&self, event: DomainEvent) -> DeliveryOutcome {
        self.delivery.deliver(event).await
    }

    /// Wait for every identify call and digest task started so far.
    pub async fn wait_idle(&self) {
        let issued = self.delivery.lock_users().issued;
        let mut applied = self.identity_applied.clone();
        // Err only once the worker is gone, in which case nothing is left to apply.
        let _ = applied.wait_for(|seq| *seq >= issued).await;

        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }
    }

    /// Number of digest tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Abort every background task, the identity worker included.
    pub fn abort_all(&self) {
        self.lock_tasks().abort_all();
        self.identity_worker.abort();
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        reap_finished(&mut tasks);
        tasks.spawn_on(task, &self.runtime);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        // A panic while holding this lock leaves the set intact.
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EventDigester {
    fn drop(&mut self) {
        // Digest tasks abort with the JoinSet.
        self.identity_worker.abort();
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_task_result(result);
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Digest task panicked");
        }
    }
}
