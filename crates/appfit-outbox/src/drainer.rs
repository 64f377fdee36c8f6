//! Batched retry of cached events.

use crate::transport::send_with_timeout;
use crate::{EventStore, IdentityProvider, Transport, WireEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was cached.
    Empty,
    /// The whole batch was acknowledged and removed from the store.
    Delivered(usize),
    /// The batch failed; every event stays cached.
    Retained(usize),
}

/// Flushes the whole store as one batch.
///
/// A batch is acknowledged in full or not at all: there is no per-event
/// retry count and no backoff between cycles.
pub struct RetryDrainer {
    store: Arc<EventStore>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    send_timeout: Duration,
}

impl RetryDrainer {
    /// Create a drainer over `store`.
    pub fn new(
        store: Arc<EventStore>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            identity,
            send_timeout,
        }
    }

    /// Run one drain cycle.
    ///
    /// Events cached after the snapshot is taken are left for the next cycle.
    pub async fn drain_once(&self) -> DrainOutcome {
        let snapshot = self.store.snapshot().await;
        if snapshot.is_empty() {
            debug!("No cached events to drain");
            return DrainOutcome::Empty;
        }

        let identity = self.identity.context().await;
        let batch: Vec<WireEvent> = snapshot
            .iter()
            .map(|event| WireEvent::from_domain(event, &identity))
            .collect();
        let ids: Vec<Uuid> = snapshot.iter().map(|event| event.id).collect();

        match send_with_timeout(self.send_timeout, self.transport.send_batch(&batch)).await {
            Ok(()) => {
                let removed = self.store.remove_all(&ids).await;
                info!(count = ids.len(), removed, "Drained cached events");
                DrainOutcome::Delivered(ids.len())
            }
            Err(e) => {
                warn!(
                    count = ids.len(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Drain failed, keeping cached events"
                );
                DrainOutcome::Retained(ids.len())
            }
        }
    }
}
