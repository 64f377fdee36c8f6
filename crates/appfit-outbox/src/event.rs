//! Event types: the cached domain event and its transient wire form.

use crate::IdentityContext;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag identifying this SDK as the origin of every wire event.
pub const EVENT_SOURCE: &str = "appfit";

/// Event properties, keyed by property name, in insertion order.
pub type EventProperties = serde_json::Map<String, serde_json::Value>;

/// An event produced by the host application.
///
/// Two events with the same `id` are the same logical occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "date", with = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: EventProperties,
}

impl DomainEvent {
    /// Create an event with a fresh id, stamped now.
    ///
    /// The timestamp is truncated to milliseconds so the event survives a
    /// trip through the cache file unchanged.
    pub fn new(name: impl Into<String>, properties: EventProperties) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now().trunc_subsecs(3),
            properties,
        }
    }

    /// Create an event with no properties.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, EventProperties::new())
    }
}

/// Payload of a [`WireEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub event_id: Uuid,
    pub name: String,
    pub properties: EventProperties,
    pub system_properties: Option<EventProperties>,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
}

/// An event as sent to the collector. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(with = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    pub event_source: String,
    pub payload: MetricEvent,
}

impl WireEvent {
    /// Build the wire form of `event` attributed to `identity`.
    pub fn from_domain(event: &DomainEvent, identity: &IdentityContext) -> Self {
        Self {
            occurred_at: event.occurred_at,
            event_source: EVENT_SOURCE.to_string(),
            payload: MetricEvent {
                event_id: event.id,
                name: event.name.clone(),
                properties: event.properties.clone(),
                system_properties: None,
                user_id: identity.user_id.clone(),
                anonymous_id: identity.anonymous_id.clone(),
            },
        }
    }
}

/// ISO-8601 UTC with millisecond precision and a literal `Z`.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
