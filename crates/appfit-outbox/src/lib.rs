//! Durable outbox for application telemetry events.
//!
//! This crate provides:
//! - EventStore: mutex-guarded map of events that still need delivery
//! - SnapshotFile: full-snapshot persistence of the store with atomic replace
//! - EventDigester: send-on-produce delivery that caches failures
//! - RetryDrainer: all-or-nothing batch delivery of everything cached
//! - RecurringTask: cancelable timers that re-arm after every run
//! - Outbox: owner of the above, tying their lifetimes together
//!
//! ```text
//! producer ──digest──▶ EventDigester ──send──▶ Transport
//!                           │ failure
//!                           ▼
//!                      EventStore ◀──restore/checkpoint──▶ SnapshotFile (cache.af)
//!                           │ snapshot
//!                           ▼
//!                      RetryDrainer ──send_batch──▶ Transport
//! ```

mod drainer;
mod error;
mod event;
mod identity;
mod outbox;
mod persistence;
mod pipeline;
mod scheduler;
mod store;
mod transport;

#[cfg(test)]
mod tests;

pub use drainer::{DrainOutcome, RetryDrainer};
pub use error::{OutboxError, OutboxResult};
pub use event::{DomainEvent, EventProperties, MetricEvent, WireEvent, EVENT_SOURCE};
pub use identity::{FileIdentityStore, IdentityContext, IdentityProvider, InMemoryIdentity};
pub use outbox::Outbox;
pub use persistence::SnapshotFile;
pub use pipeline::{DeliveryOutcome, EventDigester};
pub use scheduler::{RecurringTask, ShutdownSignal};
pub use store::EventStore;
pub use transport::{HttpTransport, HttpTransportConfig, Transport};
