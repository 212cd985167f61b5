//! The append-time fan-out spec §4 "Control flow" describes: appending an
//! event enqueues the `projection.update` job that drives every handler
//! registered for that event type, and emits a queue notification.
//!
//! Kept here rather than in `kura-worker` or a future HTTP layer because it
//! only needs the three C1 trait objects, not the handler registry itself —
//! any writer (a job handler appending a repair event, a future ingestion
//! surface) calls this instead of `EventStore::append` directly whenever
//! the appended event should trigger recomputation.

use serde_json::json;

use kura_core::Payload;

use crate::error::EventsResult;
use crate::event::{Event, NewEvent};
use crate::job::{job_type, NewJob};
use crate::store::{EventStore, JobQueue, NotifyBus};

/// Append `event`, enqueue one `projection.update` job carrying its
/// `(event_id, event_type)`, and emit a queue notification. `max_retries`
/// is the retry budget assigned to the resulting job (spec §6.4's
/// `MAX_RETRIES`).
pub async fn append_and_enqueue(
    events: &dyn EventStore,
    jobs: &dyn JobQueue,
    notify: &dyn NotifyBus,
    event: NewEvent,
    max_retries: i32,
) -> EventsResult<Event> {
    let stored = events.append(event).await?;

    let payload = Payload::new(json!({
        "event_id": stored.event_id.to_string(),
        "event_type": stored.event_type,
    }));
    jobs.enqueue(NewJob::immediate(stored.user_id, job_type::PROJECTION_UPDATE, payload, stored.timestamp, max_retries)).await?;
    notify.notify().await?;

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::UserId;

    struct RecordingJobs {
        enqueued: std::sync::Mutex<Vec<NewJob>>,
    }

    #[async_trait::async_trait]
    impl JobQueue for RecordingJobs {
        async fn enqueue(&self, job: NewJob) -> EventsResult<crate::job::Job> {
            self.enqueued.lock().unwrap().push(job.clone());
            Ok(crate::job::Job {
                job_id: kura_core::JobId::new(),
                user_id: job.user_id,
                job_type: job.job_type,
                payload: job.payload,
                status: crate::job::JobStatus::Pending,
                attempt: 0,
                max_retries: job.max_retries,
                priority: job.priority,
                scheduled_for: job.scheduled_for,
                error_message: None,
                created_at: job.scheduled_for,
                started_at: None,
                completed_at: None,
            })
        }
        async fn claim_batch(&self, _batch_size: i64, _now: chrono::DateTime<chrono::Utc>) -> EventsResult<Vec<crate::job::Job>> {
            Ok(vec![])
        }
        async fn mark_completed(&self, _job_id: kura_core::JobId) -> EventsResult<()> {
            Ok(())
        }
        async fn mark_retry_or_dead(&self, _job_id: kura_core::JobId, _error_message: &str, _next_scheduled_for: chrono::DateTime<chrono::Utc>) -> EventsResult<()> {
            Ok(())
        }
        async fn mark_dead(&self, _job_id: kura_core::JobId, _error_message: &str) -> EventsResult<()> {
            Ok(())
        }
        async fn hard_delete_user(&self, _user_id: UserId) -> EventsResult<()> {
            Ok(())
        }
    }

    struct NoopEvents;
    #[async_trait::async_trait]
    impl EventStore for NoopEvents {
        async fn append(&self, event: NewEvent) -> EventsResult<Event> {
            Ok(Event { event_id: kura_core::EventId::new(), user_id: event.user_id, timestamp: event.timestamp, event_type: event.event_type, data: event.data, metadata: event.metadata })
        }
        async fn query_by_type(&self, _user_id: UserId, _event_types: &[&str]) -> EventsResult<Vec<Event>> {
            Ok(vec![])
        }
        async fn query_all(&self, _user_id: UserId) -> EventsResult<Vec<Event>> {
            Ok(vec![])
        }
        async fn find(&self, _event_id: kura_core::EventId) -> EventsResult<Option<Event>> {
            Ok(None)
        }
        async fn hard_delete_user(&self, _user_id: UserId) -> EventsResult<()> {
            Ok(())
        }
    }

    struct CountingNotify(std::sync::atomic::AtomicUsize);
    #[async_trait::async_trait]
    impl NotifyBus for CountingNotify {
        async fn notify(&self) -> EventsResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        async fn wait(&self, _timeout: std::time::Duration) {}
    }

    #[tokio::test]
    async fn appending_an_event_enqueues_one_projection_update_job_and_notifies() {
        let events = NoopEvents;
        let jobs = RecordingJobs { enqueued: std::sync::Mutex::new(vec![]) };
        let notify = CountingNotify(std::sync::atomic::AtomicUsize::new(0));

        let user_id = UserId::new();
        let event = NewEvent::new(user_id, chrono::Utc::now(), "set.logged", Payload::empty(), Payload::empty());
        append_and_enqueue(&events, &jobs, &notify, event, 3).await.unwrap();

        let enqueued = jobs.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].job_type, job_type::PROJECTION_UPDATE);
        assert_eq!(enqueued[0].payload.get_str("event_type"), Some("set.logged"));
        assert_eq!(notify.0.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
