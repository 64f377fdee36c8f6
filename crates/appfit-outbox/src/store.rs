//! In-memory store of events awaiting delivery.

use crate::DomainEvent;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Keyed collection of undelivered events.
///
/// Every access goes through one mutex, so adds from digest tasks, removals
/// after delivery, checkpoints and drains may interleave freely.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Mutex<HashMap<Uuid, DomainEvent>>,
}

impl EventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, overwriting any event with the same id.
    pub async fn add(&self, event: DomainEvent) {
        let mut events = self.events.lock().await;
        let id = event.id;
        if events.insert(id, event).is_some() {
            debug!(event_id = %id, "Replaced cached event");
        }
    }

    /// Remove an event by id. Returns whether it was present.
    pub async fn remove(&self, id: &Uuid) -> bool {
        self.events.lock().await.remove(id).is_some()
    }

    /// Remove the cached copy of `event`, if any.
    pub async fn remove_event(&self, event: &DomainEvent) -> bool {
        self.remove(&event.id).await
    }

    /// Remove every listed id in one critical section. Returns how many were present.
    pub async fn remove_all(&self, ids: &[Uuid]) -> usize {
        let mut events = self.events.lock().await;
        ids.iter().filter(|id| events.remove(*id).is_some()).count()
    }

    /// Empty the store. Returns how many events were dropped.
    pub async fn clear(&self) -> usize {
        let mut events = self.events.lock().await;
        let count = events.len();
        events.clear();
        count
    }

    /// Copy of the current contents, oldest first.
    pub async fn snapshot(&self) -> Vec<DomainEvent> {
        let mut snapshot: Vec<DomainEvent> = self.events.lock().await.values().cloned().collect();
        snapshot.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        snapshot
    }

    /// Merge events loaded from disk.
    ///
    /// An id already present in memory keeps its in-memory value. Returns how
    /// many events were inserted.
    pub async fn restore(&self, loaded: Vec<DomainEvent>) -> usize {
        let mut events = self.events.lock().await;
        let mut inserted = 0;
        for event in loaded {
            if let std::collections::hash_map::Entry::Vacant(slot) = events.entry(event.id) {
                slot.insert(event);
                inserted += 1;
            }
        }
        inserted
    }

    /// Whether an event with this id is cached.
    pub async fn contains(&self, id: &Uuid) -> bool {
        self.events.lock().await.contains_key(id)
    }

    /// Number of cached events.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_distinct_events() {
        let store = EventStore::new();
        let e1 = DomainEvent::named("first");
        let e2 = DomainEvent::named("second");

        store.add(e1.clone()).await;
        store.add(e2.clone()).await;

        assert_eq!(store.len().await, 2);
        assert!(store.contains(&e1.id).await);
        assert!(store.contains(&e2.id).await);
    }

    #[tokio::test]
    async fn test_readd_overwrites() {
        let store = EventStore::new();
        let mut event = DomainEvent::named("purchase");
        store.add(event.clone()).await;

        event.properties.insert("amount".to_string(), json!(12));
        store.add(event.clone()).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].properties["amount"], json!(12));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = EventStore::new();
        let event = DomainEvent::named("opened");
        store.add(event.clone()).await;

        assert!(store.remove_event(&event).await);
        assert!(!store.contains(&event.id).await);

        // Absent id is a no-op
        assert!(!store.remove(&event.id).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_all_leaves_unlisted() {
        let store = EventStore::new();
        let events: Vec<_> = (0..3).map(|i| DomainEvent::named(format!("e{}", i))).collect();
        for event in &events {
            store.add(event.clone()).await;
        }

        let removed = store
            .remove_all(&[events[0].id, events[2].id, Uuid::new_v4()])
            .await;

        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 1);
        assert!(store.contains(&events[1].id).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = EventStore::new();
        store.add(DomainEvent::named("a")).await;
        store.add(DomainEvent::named("b")).await;

        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty().await);
        assert_eq!(store.clear().await, 0);
    }

    #[tokio::test]
    async fn test_restore_keeps_in_memory_copy() {
        let store = EventStore::new();
        let mut fresh = DomainEvent::named("checkout");
        fresh.properties.insert("step".to_string(), json!(2));
        store.add(fresh.clone()).await;

        let mut stale = fresh.clone();
        stale.properties.insert("step".to_string(), json!(1));
        let other = DomainEvent::named("login");

        let inserted = store.restore(vec![stale, other.clone()]).await;

        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 2);
        let snapshot = store.snapshot().await;
        let kept = snapshot.iter().find(|e| e.id == fresh.id).unwrap();
        assert_eq!(kept.properties["step"], json!(2));
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = EventStore::new();
        store.add(DomainEvent::named("a")).await;

        let snapshot = store.snapshot().await;
        store.clear().await;

        assert_eq!(snapshot.len(), 1);
        assert!(store.is_empty().await);
    }
}
