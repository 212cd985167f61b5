//! In-memory implementations of every store/queue trait (spec §A.1), for
//! tests and local development. One `RwLock<HashMap<...>>` per concern, no
//! transactions beyond the lock itself — grounded on the teacher's
//! `InMemoryEventStore` (`RwLock<HashMap<StreamKey, Vec<StoredEvent>>>`),
//! generalized from its single-stream shape to this workspace's
//! per-user/per-type lookups.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kura_core::{EventId, JobId, UserId};
use kura_events::{
    Event, EventStore, EventsError, EventsResult, InferenceRun, InferenceRunStore, Job, JobQueue, JobStatus, NewEvent, NewJob, NotifyBus, Projection,
    ProjectionStore, ProjectionWrite, SchemaCapabilityStore,
};
use tokio::sync::Notify;

/// Append-only per-user event log, in process memory.
#[derive(Default)]
pub struct InMemoryEventStore {
    by_user: RwLock<HashMap<UserId, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: NewEvent) -> EventsResult<Event> {
        let mut guard = self.by_user.write().map_err(|_| EventsError::Unavailable("event store lock poisoned".to_string()))?;
        let stream = guard.entry(event.user_id).or_default();

        if let Some(key) = event.metadata.get_str("idempotency_key") {
            if let Some(existing) = stream.iter().find(|e| e.idempotency_key() == Some(key)) {
                return Ok(existing.clone());
            }
        }

        let stored = Event {
            event_id: EventId::new(),
            user_id: event.user_id,
            timestamp: event.timestamp,
            event_type: event.event_type,
            data: event.data,
            metadata: event.metadata,
        };
        stream.push(stored.clone());
        kura_events::sort_chronologically(stream);
        Ok(stored)
    }

    async fn query_by_type(&self, user_id: UserId, event_types: &[&str]) -> EventsResult<Vec<Event>> {
        let guard = self.by_user.read().map_err(|_| EventsError::Unavailable("event store lock poisoned".to_string()))?;
        let events = guard.get(&user_id).cloned().unwrap_or_default();
        Ok(if event_types.is_empty() {
            events
        } else {
            events.into_iter().filter(|e| event_types.contains(&e.event_type.as_str())).collect()
        })
    }

    async fn query_all(&self, user_id: UserId) -> EventsResult<Vec<Event>> {
        let guard = self.by_user.read().map_err(|_| EventsError::Unavailable("event store lock poisoned".to_string()))?;
        Ok(guard.get(&user_id).cloned().unwrap_or_default())
    }

    async fn find(&self, event_id: EventId) -> EventsResult<Option<Event>> {
        let guard = self.by_user.read().map_err(|_| EventsError::Unavailable("event store lock poisoned".to_string()))?;
        Ok(guard.values().flatten().find(|e| e.event_id == event_id).cloned())
    }

    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        self.by_user.write().map_err(|_| EventsError::Unavailable("event store lock poisoned".to_string()))?.remove(&user_id);
        Ok(())
    }
}

type ProjectionKey = (UserId, String, String);

/// Materialized projection rows, keyed by `(user_id, projection_type, key)`.
#[derive(Default)]
pub struct InMemoryProjectionStore {
    rows: RwLock<HashMap<ProjectionKey, Projection>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn upsert(&self, write: ProjectionWrite) -> EventsResult<Projection> {
        let key = (write.user_id, write.projection_type.clone(), write.key.clone());
        let mut guard = self.rows.write().map_err(|_| EventsError::Unavailable("projection store lock poisoned".to_string()))?;
        let version = guard.get(&key).map(|p| p.version + 1).unwrap_or(1);
        let projection = Projection {
            user_id: write.user_id,
            projection_type: write.projection_type,
            key: write.key,
            data: write.data,
            version,
            last_event_id: write.last_event_id,
            updated_at: Utc::now(),
        };
        guard.insert(key, projection.clone());
        Ok(projection)
    }

    async fn get(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<Option<Projection>> {
        let guard = self.rows.read().map_err(|_| EventsError::Unavailable("projection store lock poisoned".to_string()))?;
        Ok(guard.get(&(user_id, projection_type.to_string(), key.to_string())).cloned())
    }

    async fn list_by_type(&self, user_id: UserId, projection_type: &str) -> EventsResult<Vec<Projection>> {
        let guard = self.rows.read().map_err(|_| EventsError::Unavailable("projection store lock poisoned".to_string()))?;
        Ok(guard.values().filter(|p| p.user_id == user_id && p.projection_type == projection_type).cloned().collect())
    }

    async fn delete(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<()> {
        self.rows
            .write()
            .map_err(|_| EventsError::Unavailable("projection store lock poisoned".to_string()))?
            .remove(&(user_id, projection_type.to_string(), key.to_string()));
        Ok(())
    }

    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        self.rows
            .write()
            .map_err(|_| EventsError::Unavailable("projection store lock poisoned".to_string()))?
            .retain(|(uid, _, _), _| *uid != user_id);
        Ok(())
    }
}

/// FIFO-by-priority job queue, in process memory. `claim_batch` is the one
/// method that matters for correctness under concurrent workers — it holds
/// the write lock for the whole claim so two callers never grab the same row.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> EventsResult<Job> {
        let stored = Job {
            job_id: JobId::new(),
            user_id: job.user_id,
            job_type: job.job_type,
            payload: job.payload,
            status: JobStatus::Pending,
            attempt: 0,
            max_retries: job.max_retries,
            priority: job.priority,
            scheduled_for: job.scheduled_for,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?.insert(stored.job_id, stored.clone());
        Ok(stored)
    }

    async fn claim_batch(&self, batch_size: i64, now: DateTime<Utc>) -> EventsResult<Vec<Job>> {
        let mut guard = self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?;
        let mut eligible: Vec<JobId> = guard
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_for <= now)
            .map(|j| j.job_id)
            .collect();
        eligible.sort_by_key(|id| {
            let j = &guard[id];
            (j.scheduled_for, -j.priority)
        });
        eligible.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let job = guard.get_mut(&id).expect("id came from this map");
            job.status = JobStatus::Processing;
            job.attempt += 1;
            job.started_at = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: JobId) -> EventsResult<()> {
        let mut guard = self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?;
        if let Some(job) = guard.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_retry_or_dead(&self, job_id: JobId, error_message: &str, next_scheduled_for: DateTime<Utc>) -> EventsResult<()> {
        let mut guard = self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?;
        if let Some(job) = guard.get_mut(&job_id) {
            job.error_message = Some(error_message.to_string());
            if job.retries_exhausted() {
                job.status = JobStatus::Dead;
            } else {
                job.status = JobStatus::Pending;
                job.scheduled_for = next_scheduled_for;
            }
        }
        Ok(())
    }

    async fn mark_dead(&self, job_id: JobId, error_message: &str) -> EventsResult<()> {
        let mut guard = self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?;
        if let Some(job) = guard.get_mut(&job_id) {
            job.status = JobStatus::Dead;
            job.error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
        self.jobs.write().map_err(|_| EventsError::Unavailable("job queue lock poisoned".to_string()))?.retain(|_, j| j.user_id != user_id);
        Ok(())
    }
}

/// Append-only inference telemetry, in process memory.
#[derive(Default)]
pub struct InMemoryInferenceRunStore {
    runs: RwLock<Vec<InferenceRun>>,
}

impl InMemoryInferenceRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InferenceRunStore for InMemoryInferenceRunStore {
    async fn record(&self, run: InferenceRun) -> EventsResult<()> {
        self.runs.write().map_err(|_| EventsError::Unavailable("inference run store lock poisoned".to_string()))?.push(run);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> EventsResult<u64> {
        let mut guard = self.runs.write().map_err(|_| EventsError::Unavailable("inference run store lock poisoned".to_string()))?;
        let before = guard.len();
        guard.retain(|r| r.completed_at >= cutoff);
        Ok((before - guard.len()) as u64)
    }
}

/// In-process notification bus backed by `tokio::sync::Notify` — stands in
/// for Postgres `LISTEN`/`NOTIFY` in tests, where every claim-eligible
/// worker lives in the same process.
#[derive(Default)]
pub struct InMemoryNotifyBus {
    notify: Notify,
}

impl InMemoryNotifyBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotifyBus for InMemoryNotifyBus {
    async fn notify(&self) -> EventsResult<()> {
        self.notify.notify_waiters();
        Ok(())
    }

    async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

/// Every relation reported present — for tests and local development, where
/// there is no migration skew to model (spec §A.6).
#[derive(Default)]
pub struct InMemorySchemaCapabilities;

impl InMemorySchemaCapabilities {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SchemaCapabilityStore for InMemorySchemaCapabilities {
    async fn relation_exists(&self, _relation_name: &str) -> EventsResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::Payload;
    use serde_json::json;

    #[tokio::test]
    async fn append_is_idempotent_per_user_on_idempotency_key() {
        let store = InMemoryEventStore::new();
        let user_id = UserId::new();
        let now = Utc::now();
        let metadata = Payload::new(json!({"idempotency_key": "abc"}));
        let first = store.append(NewEvent::new(user_id, now, "set.logged", Payload::empty(), metadata.clone())).await.unwrap();
        let second = store.append(NewEvent::new(user_id, now, "set.logged", Payload::empty(), metadata)).await.unwrap();
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(store.query_all(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_increments_version_per_key() {
        let store = InMemoryProjectionStore::new();
        let user_id = UserId::new();
        let write = |data: serde_json::Value| ProjectionWrite::new(user_id, "recovery", "overview", Payload::new(data), None);
        let first = store.upsert(write(json!({"v": 1}))).await.unwrap();
        let second = store.upsert(write(json!({"v": 2}))).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn claim_batch_only_takes_pending_due_jobs() {
        let queue = InMemoryJobQueue::new();
        let user_id = UserId::new();
        let now = Utc::now();
        queue.enqueue(NewJob::immediate(user_id, "projection.update", Payload::empty(), now, 3)).await.unwrap();
        queue
            .enqueue(NewJob { user_id, job_type: "projection.update".to_string(), payload: Payload::empty(), max_retries: 3, priority: 0, scheduled_for: now + chrono::Duration::hours(1) })
            .await
            .unwrap();

        let claimed = queue.claim_batch(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].attempt, 1);
    }
}
