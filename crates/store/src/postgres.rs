//! Postgres-backed implementations of every store/queue trait (spec §A.1),
//! grounded on the teacher's `PostgresEventStore` — a thin `Arc<PgPool>`
//! wrapper, one `sqlx::query` per operation, errors funneled through
//! [`crate::error::map_sqlx_error`], `#[instrument(..., err)]` spans.
//!
//! All four stores share one pool, so `PostgresStore` implements every
//! trait rather than the workspace juggling four separate connection
//! handles.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kura_core::{EventId, JobId, Payload, UserId};
use kura_events::{
    Event, EventStore, EventsResult, InferenceRun, InferenceRunStore, InferenceStatus, Job, JobQueue, JobStatus, NewEvent, NewJob, NotifyBus, Projection,
    ProjectionStore, ProjectionWrite, SchemaCapabilityStore,
};
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use tracing::{instrument, Span};

use crate::error::map_sqlx_error;

/// The job-queue LISTEN/NOTIFY channel every worker subscribes to (spec §6.2).
pub const JOB_QUEUE_CHANNEL: &str = "kura_jobs";

/// Fixed reconnect delay after a dropped LISTEN connection, independent of
/// the caller's wait timeout (spec §5 "Cancellation and timeouts").
const LISTEN_RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// A single Postgres connection pool, implementing every store/queue trait.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: uuid::Uuid,
    user_id: uuid::Uuid,
    timestamp: DateTime<Utc>,
    event_type: String,
    data: serde_json::Value,
    metadata: serde_json::Value,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            event_id: EventId::from_uuid(row.event_id),
            user_id: UserId::from_uuid(row.user_id),
            timestamp: row.timestamp,
            event_type: row.event_type,
            data: Payload::new(row.data),
            metadata: Payload::new(row.metadata),
        }
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    #[instrument(skip(self, event), fields(user_id = %event.user_id, event_type = %event.event_type), err)]
    async fn append(&self, event: NewEvent) -> EventsResult<Event> {
        if let Some(key) = event.idempotency_key() {
            let existing = sqlx::query_as::<_, EventRow>(
                r#"SELECT event_id, user_id, timestamp, event_type, data, metadata
                   FROM events WHERE user_id = $1 AND metadata ->> 'idempotency_key' = $2
                   LIMIT 1"#,
            )
            .bind(event.user_id.as_uuid())
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("append:idempotency_lookup", e))?;

            if let Some(row) = existing {
                return Ok(row.into());
            }
        }

        let row = sqlx::query_as::<_, EventRow>(
            r#"INSERT INTO events (event_id, user_id, timestamp, event_type, data, metadata)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING event_id, user_id, timestamp, event_type, data, metadata"#,
        )
        .bind(EventId::new().as_uuid())
        .bind(event.user_id.as_uuid())
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(event.data.as_value())
        .bind(event.metadata.as_value())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn query_by_type(&self, user_id: UserId, event_types: &[&str]) -> EventsResult<Vec<Event>> {
        let rows = if event_types.is_empty() {
            sqlx::query_as::<_, EventRow>(
                r#"SELECT event_id, user_id, timestamp, event_type, data, metadata
                   FROM events WHERE user_id = $1 ORDER BY timestamp ASC, event_id ASC"#,
            )
            .bind(user_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
        } else {
            let types: Vec<&str> = event_types.to_vec();
            sqlx::query_as::<_, EventRow>(
                r#"SELECT event_id, user_id, timestamp, event_type, data, metadata
                   FROM events WHERE user_id = $1 AND event_type = ANY($2)
                   ORDER BY timestamp ASC, event_id ASC"#,
            )
            .bind(user_id.as_uuid())
            .bind(&types as &[&str])
            .fetch_all(&*self.pool)
            .await
        }
        .map_err(|e| map_sqlx_error("query_by_type", e))?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn query_all(&self, user_id: UserId) -> EventsResult<Vec<Event>> {
        self.query_by_type(user_id, &[]).await
    }

    #[instrument(skip(self), err)]
    async fn find(&self, event_id: EventId) -> EventsResult<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"SELECT event_id, user_id, timestamp, event_type, data, metadata
               FROM events WHERE event_id = $1"#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find", e))?;

        Ok(row.map(Event::from))
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        sqlx::query("DELETE FROM events WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("hard_delete_user:events", e))?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ProjectionRow {
    user_id: uuid::Uuid,
    projection_type: String,
    key: String,
    data: serde_json::Value,
    version: i64,
    last_event_id: Option<uuid::Uuid>,
    updated_at: DateTime<Utc>,
}

impl From<ProjectionRow> for Projection {
    fn from(row: ProjectionRow) -> Self {
        Projection {
            user_id: UserId::from_uuid(row.user_id),
            projection_type: row.projection_type,
            key: row.key,
            data: Payload::new(row.data),
            version: row.version,
            last_event_id: row.last_event_id.map(EventId::from_uuid),
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl ProjectionStore for PostgresStore {
    #[instrument(skip(self, write), fields(user_id = %write.user_id, projection_type = %write.projection_type, key = %write.key), err)]
    async fn upsert(&self, write: ProjectionWrite) -> EventsResult<Projection> {
        let row = sqlx::query_as::<_, ProjectionRow>(
            r#"INSERT INTO projections (user_id, projection_type, key, data, version, last_event_id, updated_at)
               VALUES ($1, $2, $3, $4, 1, $5, now())
               ON CONFLICT (user_id, projection_type, key)
               DO UPDATE SET data = EXCLUDED.data,
                             version = projections.version + 1,
                             last_event_id = EXCLUDED.last_event_id,
                             updated_at = now()
               RETURNING user_id, projection_type, key, data, version, last_event_id, updated_at"#,
        )
        .bind(write.user_id.as_uuid())
        .bind(&write.projection_type)
        .bind(&write.key)
        .bind(write.data.as_value())
        .bind(write.last_event_id.map(|id| *id.as_uuid()))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(user_id = %user_id, projection_type = %projection_type, key = %key), err)]
    async fn get(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<Option<Projection>> {
        let row = sqlx::query_as::<_, ProjectionRow>(
            r#"SELECT user_id, projection_type, key, data, version, last_event_id, updated_at
               FROM projections WHERE user_id = $1 AND projection_type = $2 AND key = $3"#,
        )
        .bind(user_id.as_uuid())
        .bind(projection_type)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        Ok(row.map(Projection::from))
    }

    #[instrument(skip(self), fields(user_id = %user_id, projection_type = %projection_type), err)]
    async fn list_by_type(&self, user_id: UserId, projection_type: &str) -> EventsResult<Vec<Projection>> {
        let rows = sqlx::query_as::<_, ProjectionRow>(
            r#"SELECT user_id, projection_type, key, data, version, last_event_id, updated_at
               FROM projections WHERE user_id = $1 AND projection_type = $2 ORDER BY key ASC"#,
        )
        .bind(user_id.as_uuid())
        .bind(projection_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_type", e))?;

        Ok(rows.into_iter().map(Projection::from).collect())
    }

    #[instrument(skip(self), fields(user_id = %user_id, projection_type = %projection_type, key = %key), err)]
    async fn delete(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<()> {
        sqlx::query("DELETE FROM projections WHERE user_id = $1 AND projection_type = $2 AND key = $3")
            .bind(user_id.as_uuid())
            .bind(projection_type)
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        sqlx::query("DELETE FROM projections WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("hard_delete_user:projections", e))?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: uuid::Uuid,
    user_id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempt: i32,
    max_retries: i32,
    priority: i32,
    scheduled_for: DateTime<Utc>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_job_status(raw: &str) -> JobStatus {
    match raw {
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "dead" => JobStatus::Dead,
        _ => JobStatus::Pending,
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            job_id: JobId::from_uuid(row.job_id),
            user_id: UserId::from_uuid(row.user_id),
            job_type: row.job_type,
            payload: Payload::new(row.payload),
            status: parse_job_status(&row.status),
            attempt: row.attempt,
            max_retries: row.max_retries,
            priority: row.priority,
            scheduled_for: row.scheduled_for,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[async_trait]
impl JobQueue for PostgresStore {
    #[instrument(skip(self, job), fields(user_id = %job.user_id, job_type = %job.job_type), err)]
    async fn enqueue(&self, job: NewJob) -> EventsResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"INSERT INTO jobs (job_id, user_id, job_type, payload, status, attempt, max_retries, priority, scheduled_for, created_at)
               VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, now())
               RETURNING job_id, user_id, job_type, payload, status, attempt, max_retries, priority, scheduled_for, error_message, created_at, started_at, completed_at"#,
        )
        .bind(JobId::new().as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(&job.job_type)
        .bind(job.payload.as_value())
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.scheduled_for)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(batch_size), err)]
    async fn claim_batch(&self, batch_size: i64, now: DateTime<Utc>) -> EventsResult<Vec<Job>> {
        let span = Span::current();
        span.record("batch_size", batch_size);

        let rows = sqlx::query_as::<_, JobRow>(
            r#"UPDATE jobs SET status = 'processing', attempt = attempt + 1, started_at = $1
               WHERE job_id IN (
                   SELECT job_id FROM jobs
                   WHERE status = 'pending' AND scheduled_for <= $1
                   ORDER BY scheduled_for ASC, priority DESC, job_id ASC
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING job_id, user_id, job_type, payload, status, attempt, max_retries, priority, scheduled_for, error_message, created_at, started_at, completed_at"#,
        )
        .bind(now)
        .bind(batch_size)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    #[instrument(skip(self), err)]
    async fn mark_completed(&self, job_id: JobId) -> EventsResult<()> {
        sqlx::query("UPDATE jobs SET status = 'completed', completed_at = now() WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_completed", e))?;
        Ok(())
    }

    #[instrument(skip(self, error_message), err)]
    async fn mark_retry_or_dead(&self, job_id: JobId, error_message: &str, next_scheduled_for: DateTime<Utc>) -> EventsResult<()> {
        // `max_retries` counts retries, not attempts (spec §8.2, scenario
        // S6): exhaustion is `attempt > max_retries`, matching
        // `Job::retries_exhausted`.
        sqlx::query(
            r#"UPDATE jobs SET
                   error_message = $2,
                   status = CASE WHEN attempt > max_retries THEN 'dead' ELSE 'pending' END,
                   scheduled_for = CASE WHEN attempt > max_retries THEN scheduled_for ELSE $3 END
               WHERE job_id = $1"#,
        )
        .bind(job_id.as_uuid())
        .bind(error_message)
        .bind(next_scheduled_for)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retry_or_dead", e))?;
        Ok(())
    }

    #[instrument(skip(self, error_message), err)]
    async fn mark_dead(&self, job_id: JobId, error_message: &str) -> EventsResult<()> {
        sqlx::query("UPDATE jobs SET status = 'dead', error_message = $2 WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .bind(error_message)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_dead", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        sqlx::query("DELETE FROM jobs WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("hard_delete_user:jobs", e))?;
        Ok(())
    }
}

#[async_trait]
impl InferenceRunStore for PostgresStore {
    #[instrument(skip(self, run), fields(user_id = %run.user_id, projection_type = %run.projection_type, key = %run.key), err)]
    async fn record(&self, run: InferenceRun) -> EventsResult<()> {
        let status = match run.status {
            InferenceStatus::Success => "success",
            InferenceStatus::Failed => "failed",
            InferenceStatus::Skipped => "skipped",
        };
        let taxonomy = run.error_taxonomy.map(|t| format!("{t:?}").to_lowercase());

        sqlx::query(
            r#"INSERT INTO inference_runs
                   (user_id, projection_type, key, engine, status, diagnostics, error_message, error_taxonomy, started_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(run.user_id.as_uuid())
        .bind(&run.projection_type)
        .bind(&run.key)
        .bind(&run.engine)
        .bind(status)
        .bind(run.diagnostics.as_value())
        .bind(&run.error_message)
        .bind(taxonomy)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> EventsResult<u64> {
        let result = sqlx::query("DELETE FROM inference_runs WHERE completed_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NotifyBus for PostgresStore {
    async fn notify(&self) -> EventsResult<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(JOB_QUEUE_CHANNEL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("notify", e))?;
        Ok(())
    }

    async fn wait(&self, timeout: std::time::Duration) {
        let Ok(mut listener) = PgListener::connect_with(&self.pool).await else {
            tokio::time::sleep(LISTEN_RECONNECT_BACKOFF).await;
            return;
        };
        if listener.listen(JOB_QUEUE_CHANNEL).await.is_err() {
            tokio::time::sleep(LISTEN_RECONNECT_BACKOFF).await;
            return;
        }
        // `recv` resolves once per dropped connection too (sqlx reconnects the
        // underlying socket internally); a lost connection surfaces as a
        // timed-out wait here rather than an error, which is fine since the
        // caller just loops and calls `wait` again.
        let _ = tokio::time::timeout(timeout, listener.recv()).await;
    }
}

#[async_trait]
impl SchemaCapabilityStore for PostgresStore {
    /// `to_regclass` avoids a transaction-aborting `undefined_table` error,
    /// unlike querying `information_schema` inside a failed transaction
    /// (ported from `schema_capabilities.relation_exists`).
    #[instrument(skip(self), fields(relation_name), err)]
    async fn relation_exists(&self, relation_name: &str) -> EventsResult<bool> {
        let qualified = format!("public.{relation_name}");
        let exists: (Option<String>,) = sqlx::query_as("SELECT to_regclass($1)::text")
            .bind(&qualified)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("relation_exists", e))?;
        Ok(exists.0.is_some())
    }
}
