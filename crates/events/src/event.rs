//! The event entity (spec §3.1: "Event").
//!
//! Events are the single source of truth: immutable, append-only, totally
//! ordered per user by `(timestamp, event_id)`. `data`/`metadata` are
//! unstructured payloads; handlers parse them into tagged shapes at the
//! boundary (see `kura_core::Payload`).

use chrono::{DateTime, Utc};
use kura_core::{EventId, Payload, UserId};
use serde::{Deserialize, Serialize};

/// A persisted event, as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Payload,
    pub metadata: Payload,
}

impl Event {
    /// The idempotency key carried in `metadata.idempotency_key`, if any.
    ///
    /// This is the universal dedup key for writes (spec §6.1).
    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata.get_str("idempotency_key")
    }

    /// The authoritative session id carried in `metadata.session_id`, if present.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get_str("session_id")
    }
}

/// A not-yet-persisted event, as produced by a writer (a handler appending a
/// repair event, or an external caller). The store assigns `event_id` if the
/// caller omits one, and dedups by `metadata.idempotency_key` per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Payload,
    pub metadata: Payload,
}

impl NewEvent {
    pub fn new(
        user_id: UserId,
        timestamp: DateTime<Utc>,
        event_type: impl Into<String>,
        data: Payload,
        metadata: Payload,
    ) -> Self {
        Self {
            user_id,
            timestamp,
            event_type: event_type.into(),
            data,
            metadata,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata.get_str("idempotency_key")
    }
}

/// Total order used for every read path in the system (spec §3.2, §5).
pub fn chronological_key(event: &Event) -> (DateTime<Utc>, EventId) {
    (event.timestamp, event.event_id)
}

/// Sort a mutable slice of events into the canonical `(timestamp, event_id)` order.
pub fn sort_chronologically(events: &mut [Event]) {
    events.sort_by(|a, b| chronological_key(a).cmp(&chronological_key(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(ts: &str, id: EventId) -> Event {
        Event {
            event_id: id,
            user_id: UserId::new(),
            timestamp: ts.parse().unwrap(),
            event_type: "set.logged".into(),
            data: Payload::new(json!({})),
            metadata: Payload::new(json!({})),
        }
    }

    #[test]
    fn sorts_by_timestamp_then_event_id() {
        let a = ev("2026-01-01T00:00:00Z", EventId::new());
        let b = ev("2026-01-01T00:00:00Z", EventId::new());
        let mut events = vec![b.clone(), a.clone()];
        sort_chronologically(&mut events);
        let expected_first = if a.event_id.as_uuid() < b.event_id.as_uuid() {
            a.event_id
        } else {
            b.event_id
        };
        assert_eq!(events[0].event_id, expected_first);
    }
}
