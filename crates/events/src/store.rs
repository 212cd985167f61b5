//! Store and queue contracts (C1, spec §4.1) consumed by the rest of the
//! workspace. `kura-store` provides Postgres and in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kura_core::{EventId, JobId, UserId};

use crate::error::EventsResult;
use crate::event::{Event, NewEvent};
use crate::inference_run::InferenceRun;
use crate::job::{Job, NewJob};
use crate::projection::{Projection, ProjectionWrite};

/// Append-only event log plus per-user ordered reads (spec §4.1).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, deduplicating by `metadata.idempotency_key` per user.
    /// Returns the event as persisted (existing row, if this was a duplicate).
    async fn append(&self, event: NewEvent) -> EventsResult<Event>;

    /// All events for a user whose `event_type` is in `event_types`, ordered
    /// by `(timestamp, event_id)`. An empty `event_types` means "all types".
    async fn query_by_type(&self, user_id: UserId, event_types: &[&str]) -> EventsResult<Vec<Event>>;

    /// All events for a user, ordered by `(timestamp, event_id)`.
    async fn query_all(&self, user_id: UserId) -> EventsResult<Vec<Event>>;

    async fn find(&self, event_id: EventId) -> EventsResult<Option<Event>>;

    /// Cascading hard delete of every event owned by a user (spec §A.6,
    /// `account.hard_delete` — the one documented exception to append-only).
    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()>;
}

/// Projection upsert/read/delete (spec §4.1, §3.1).
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Upsert by `(user_id, projection_type, key)`, incrementing `version`.
    async fn upsert(&self, write: ProjectionWrite) -> EventsResult<Projection>;

    async fn get(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<Option<Projection>>;

    /// All rows for a user under one `projection_type` (e.g. all
    /// `exercise_progression` keys for the alias-consolidation scan).
    async fn list_by_type(&self, user_id: UserId, projection_type: &str) -> EventsResult<Vec<Projection>>;

    async fn delete(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<()>;

    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()>;
}

/// Background job queue (spec §4.1, §4.5).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> EventsResult<Job>;

    /// Atomically transition up to `batch_size` oldest eligible
    /// (`pending`, `scheduled_for <= now`) jobs to `processing`, skipping
    /// rows locked by other workers, ordered by `(scheduled_for, priority
    /// DESC, id)`. Stamps `started_at`, increments `attempt`. Commits
    /// immediately so claims survive a crash (spec §4.5 step 2).
    async fn claim_batch(&self, batch_size: i64, now: DateTime<Utc>) -> EventsResult<Vec<Job>>;

    async fn mark_completed(&self, job_id: JobId) -> EventsResult<()>;

    /// Transition back to `pending` with a new `scheduled_for` and recorded
    /// error (retries remaining), or to `dead` (retries exhausted).
    async fn mark_retry_or_dead(&self, job_id: JobId, error_message: &str, next_scheduled_for: DateTime<Utc>) -> EventsResult<()>;

    async fn mark_dead(&self, job_id: JobId, error_message: &str) -> EventsResult<()>;

    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()>;
}

/// Append-only inference telemetry (spec §3.1, §7).
#[async_trait]
pub trait InferenceRunStore: Send + Sync {
    async fn record(&self, run: InferenceRun) -> EventsResult<()>;

    /// Used by the `maintenance.log_retention` job (spec §A.6).
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> EventsResult<u64>;
}

/// Push notification on the well-known job-queue channel (spec §6.2).
///
/// The notification payload is informational only; the canonical source of
/// truth remains the queue table, so implementations may coalesce or drop
/// notifications under load without breaking correctness — the poll loop is
/// the backstop.
#[async_trait]
pub trait NotifyBus: Send + Sync {
    async fn notify(&self) -> EventsResult<()>;

    /// Wait for the next notification, or return after `timeout` elapses
    /// (used to bound the listen loop's wait, spec §4.5).
    async fn wait(&self, timeout: std::time::Duration);
}

/// Probes whether an optional relation exists in the deployed schema (spec
/// §A.6 "Schema-capability degradation"), so a handler with an optional
/// enrichment path can degrade gracefully on a database that is behind a
/// migration instead of failing the whole projection recompute.
#[async_trait]
pub trait SchemaCapabilityStore: Send + Sync {
    /// `true` once the named relation exists in the current schema.
    async fn relation_exists(&self, relation_name: &str) -> EventsResult<bool>;
}
