//! The projection entity (spec §3.1: "Projection").

use chrono::{DateTime, Utc};
use kura_core::{EventId, Payload, UserId};
use serde::{Deserialize, Serialize};

/// A materialized read model row, identified by `(user_id, projection_type, key)`.
///
/// `version` only ever increases (projection idempotence, spec §3.2); it is
/// the store's job to bump it on every upsert, not the handler's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub user_id: UserId,
    pub projection_type: String,
    pub key: String,
    pub data: Payload,
    pub version: i64,
    pub last_event_id: Option<EventId>,
    pub updated_at: DateTime<Utc>,
}

/// What a handler produces for one `(projection_type, key)` before the store
/// assigns a version and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionWrite {
    pub user_id: UserId,
    pub projection_type: String,
    pub key: String,
    pub data: Payload,
    pub last_event_id: Option<EventId>,
}

impl ProjectionWrite {
    pub fn new(
        user_id: UserId,
        projection_type: impl Into<String>,
        key: impl Into<String>,
        data: Payload,
        last_event_id: Option<EventId>,
    ) -> Self {
        Self {
            user_id,
            projection_type: projection_type.into(),
            key: key.into(),
            data,
            last_event_id,
        }
    }
}
