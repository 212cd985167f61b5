//! The worker runtime (C5, spec §4.5): a listen loop and a poll loop, both
//! driving the same `process_batch`, claiming jobs under strict
//! at-most-one-concurrent-processing semantics with bounded retries.
//!
//! Follows the `JobExecutor`/`ProjectionWorker` shape familiar from
//! executor-style job runners (config struct with a `name`, a handle that
//! signals shutdown and joins, a loop that claims/executes/updates stats)
//! — rebuilt onto `tokio` tasks and the async `kura-events` store traits
//! rather than a `std::thread`/`mpsc` pair, since every collaborator here
//! suspends on I/O instead of blocking a thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use kura_core::{Payload, UserId};
use kura_events::{
    job_type, retry_backoff_seconds, EventStore, InferenceRun, InferenceRunStore, InferenceStatus, Job, JobQueue, NotifyBus, ProjectionStore, SchemaCapabilityStore,
};
use kura_registry::{HandlerContext, HandlerInvocation, HandlerOutcome, Registry};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Tunables for one worker process (spec §6.4).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Upper bound on how long the listen loop waits for a notification
    /// before it re-checks for shutdown and falls through to the next tick.
    pub listen_timeout: Duration,
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            listen_timeout: Duration::from_secs(5),
            name: "kura-worker".to_string(),
        }
    }
}

/// Everything `process_batch` needs, grouped so `run` can clone a single
/// struct into both the listen and poll tasks.
#[derive(Clone)]
pub struct WorkerDeps {
    pub events: Arc<dyn EventStore>,
    pub projections: Arc<dyn ProjectionStore>,
    pub inference_runs: Arc<dyn InferenceRunStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub notify: Arc<dyn NotifyBus>,
    pub schema_capabilities: Arc<dyn SchemaCapabilityStore>,
    pub registry: Arc<OnceLock<Registry>>,
    /// Retry budget assigned to jobs a handler enqueues via its own appends
    /// (a Tier-A repair's recompute fan-out), mirroring `MAX_RETRIES`.
    pub max_retries: i32,
}

impl WorkerDeps {
    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            events: self.events.clone(),
            projections: self.projections.clone(),
            inference_runs: self.inference_runs.clone(),
            jobs: self.jobs.clone(),
            notify: self.notify.clone(),
            schema_capabilities: self.schema_capabilities.clone(),
            max_retries: self.max_retries,
        }
    }

    fn registry(&self) -> &Registry {
        self.registry.get().expect("registry initialized before the worker starts")
    }
}

/// Point-in-time counters, read by health checks or tests.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub jobs_claimed: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_dead_lettered: AtomicU64,
}

/// Handle to a running worker: signal shutdown, then await both loops.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    listen_task: tokio::task::JoinHandle<()>,
    poll_task: tokio::task::JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown (spec §4.5 "Cancellation"): the listen loop exits its
    /// wait immediately; the poll loop finishes its in-flight batch before
    /// exiting. No new jobs are claimed after this call returns.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.listen_task.await;
        let _ = self.poll_task.await;
    }
}

/// Spawn the worker: one listen task (wakes on notification or
/// `listen_timeout`) and one poll task (ticks every `poll_interval`), both
/// calling [`process_batch`] (spec §4.5 "Scheduling model").
pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> WorkerHandle {
    let stats = Arc::new(WorkerStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_task = tokio::spawn(listen_loop(deps.clone(), config.clone(), shutdown_rx.clone(), stats.clone()));
    let poll_task = tokio::spawn(poll_loop(deps, config, shutdown_rx, stats.clone()));

    WorkerHandle { shutdown: shutdown_tx, listen_task, poll_task, stats }
}

async fn listen_loop(deps: WorkerDeps, config: WorkerConfig, mut shutdown: watch::Receiver<bool>, stats: Arc<WorkerStats>) {
    info!(worker = %config.name, "listen loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        deps.notify.wait(config.listen_timeout).await;
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = process_batch(&deps, &config, &stats).await {
            error!(worker = %config.name, error = %err, "listen-triggered batch failed");
        }
    }
    info!(worker = %config.name, "listen loop stopped");
}

async fn poll_loop(deps: WorkerDeps, config: WorkerConfig, mut shutdown: watch::Receiver<bool>, stats: Arc<WorkerStats>) {
    info!(worker = %config.name, "poll loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = process_batch(&deps, &config, &stats).await {
            error!(worker = %config.name, error = %err, "poll batch failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!(worker = %config.name, "poll loop stopped");
}

/// Claim up to `batch_size` due jobs and run each to completion,
/// sequentially, in claim order (spec §4.5 step 2–3, §6.1's "within a batch"
/// ordering guarantee). A job already in flight elsewhere is never claimed
/// twice — `claim_batch` is the store's atomic boundary for that.
pub async fn process_batch(deps: &WorkerDeps, config: &WorkerConfig, stats: &WorkerStats) -> kura_events::EventsResult<()> {
    let now = Utc::now();
    let claimed = deps.jobs.claim_batch(config.batch_size, now).await?;
    stats.jobs_claimed.fetch_add(claimed.len() as u64, Ordering::Relaxed);

    for job in claimed {
        run_job(deps, stats, job).await;
    }
    Ok(())
}

async fn run_job(deps: &WorkerDeps, stats: &WorkerStats, job: Job) {
    let job_id = job.job_id;
    let attempt = job.attempt;
    info!(job_id = %job_id, job_type = %job.job_type, attempt, "claimed job");

    let outcome = dispatch(deps, &job).await;

    match outcome {
        HandlerOutcome::Completed => {
            if let Err(err) = deps.jobs.mark_completed(job_id).await {
                error!(job_id = %job_id, error = %err, "failed to mark job completed");
                return;
            }
            stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
            info!(job_id = %job_id, "job completed");
        }
        HandlerOutcome::Permanent(message) => {
            if let Err(err) = deps.jobs.mark_dead(job_id, &message).await {
                error!(job_id = %job_id, error = %err, "failed to dead-letter job");
                return;
            }
            stats.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
            warn!(job_id = %job_id, error = %message, "job dead-lettered (permanent error)");
        }
        HandlerOutcome::Retryable(message) => {
            if job.retries_exhausted() {
                if let Err(err) = deps.jobs.mark_dead(job_id, &message).await {
                    error!(job_id = %job_id, error = %err, "failed to dead-letter exhausted job");
                    return;
                }
                stats.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, attempt, error = %message, "job dead-lettered (retries exhausted)");
            } else {
                let next = Utc::now() + chrono::Duration::seconds(retry_backoff_seconds(job.attempt));
                if let Err(err) = deps.jobs.mark_retry_or_dead(job_id, &message, next).await {
                    error!(job_id = %job_id, error = %err, "failed to schedule retry");
                    return;
                }
                stats.jobs_retried.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, attempt, next_scheduled_for = %next, error = %message, "job scheduled for retry");
            }
        }
    }
}

/// Route a claimed job to its job-type behavior (spec §4.5 step 3, §A.6's
/// supplemental catalog). Unknown job types dead-letter immediately — spec
/// §7 "Permanent job errors".
async fn dispatch(deps: &WorkerDeps, job: &Job) -> HandlerOutcome {
    match job.job_type.as_str() {
        job_type::PROJECTION_UPDATE => dispatch_projection_update(deps, job).await,
        job_type::DEEP_INSIGHT => dispatch_deep_insight(deps, job).await,
        job_type::LOG_RETENTION => dispatch_log_retention(deps, job).await,
        job_type::ACCOUNT_HARD_DELETE => dispatch_hard_delete(deps, job).await,
        other => HandlerOutcome::Permanent(format!("no handler for job type '{other}'")),
    }
}

/// The only job type produced by the append path (spec §4 "Control flow"):
/// payload carries the triggering event's identity; the router runs every
/// handler registered for that event type, plus any custom projection rules
/// that declare it as a source event (spec §4.4.9).
async fn dispatch_projection_update(deps: &WorkerDeps, job: &Job) -> HandlerOutcome {
    let Some(event_type) = job.payload.get_str("event_type") else {
        return HandlerOutcome::Permanent("projection.update payload missing event_type".to_string());
    };
    let event_id = match job.payload.get_str("event_id").map(str::parse) {
        Some(Ok(id)) => id,
        Some(Err(e)) => return HandlerOutcome::Permanent(format!("projection.update payload has invalid event_id: {e}")),
        None => return HandlerOutcome::Permanent("projection.update payload missing event_id".to_string()),
    };

    let ctx = deps.handler_context();
    let invocation = HandlerInvocation { user_id: job.user_id, event_id, event_type: event_type.to_string() };

    for handler in deps.registry().handlers_for(event_type) {
        match handler.handle(&ctx, &invocation).await {
            HandlerOutcome::Completed => {}
            other => return other,
        }
    }

    if kura_handlers::custom_projection::has_matching_custom_rules(&ctx, job.user_id, event_type).await.unwrap_or(false) {
        if let Err(e) = kura_handlers::custom_projection::recompute_matching_rules(&ctx, job.user_id, event_type).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
    }

    HandlerOutcome::Completed
}

/// No-op stub: the agent-facing insight generator itself is out of scope
/// (spec §A.6), so this job only records that a run was attempted and
/// skipped, for telemetry continuity.
async fn dispatch_deep_insight(deps: &WorkerDeps, job: &Job) -> HandlerOutcome {
    let now = Utc::now();
    let run = InferenceRun {
        user_id: job.user_id,
        projection_type: "analysis".to_string(),
        key: "deep_insight".to_string(),
        engine: "deep_insight".to_string(),
        status: InferenceStatus::Skipped,
        diagnostics: Payload::new(serde_json::json!({"reason": "deep insight generation is out of scope"})),
        error_message: None,
        error_taxonomy: None,
        started_at: now,
        completed_at: now,
    };
    match deps.inference_runs.record(run).await {
        Ok(()) => HandlerOutcome::Completed,
        Err(e) => HandlerOutcome::Retryable(e.to_string()),
    }
}

/// Deletes `InferenceRun` rows older than the retention window carried in
/// the job payload (`retain_days`), falling back to 90 days (spec §A.6).
async fn dispatch_log_retention(deps: &WorkerDeps, job: &Job) -> HandlerOutcome {
    let retain_days = job.payload.get_f64("retain_days").unwrap_or(90.0);
    let cutoff = Utc::now() - chrono::Duration::seconds((retain_days * 86_400.0) as i64);
    match deps.inference_runs.delete_older_than(cutoff).await {
        Ok(deleted) => {
            info!(job_id = %job.job_id, deleted, cutoff = %cutoff, "log retention swept inference runs");
            HandlerOutcome::Completed
        }
        Err(e) => HandlerOutcome::Retryable(e.to_string()),
    }
}

/// Cascades a hard delete across every store (spec §3.1: the one documented
/// exception to "events are never deleted").
async fn dispatch_hard_delete(deps: &WorkerDeps, job: &Job) -> HandlerOutcome {
    let user_id: UserId = job.user_id;
    if let Err(e) = deps.projections.hard_delete_user(user_id).await {
        return HandlerOutcome::Retryable(e.to_string());
    }
    if let Err(e) = deps.events.hard_delete_user(user_id).await {
        return HandlerOutcome::Retryable(e.to_string());
    }
    if let Err(e) = deps.jobs.hard_delete_user(user_id).await {
        return HandlerOutcome::Retryable(e.to_string());
    }
    HandlerOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::UserId;
    use kura_store::{InMemoryEventStore, InMemoryInferenceRunStore, InMemoryJobQueue, InMemoryNotifyBus, InMemoryProjectionStore, InMemorySchemaCapabilities};

    fn deps() -> WorkerDeps {
        WorkerDeps {
            events: Arc::new(InMemoryEventStore::new()),
            projections: Arc::new(InMemoryProjectionStore::new()),
            inference_runs: Arc::new(InMemoryInferenceRunStore::new()),
            jobs: Arc::new(InMemoryJobQueue::new()),
            notify: Arc::new(InMemoryNotifyBus::new()),
            schema_capabilities: Arc::new(InMemorySchemaCapabilities::new()),
            registry: kura_handlers::register_all(&kura_handlers::HandlersConfig::default()),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn unknown_job_type_dead_letters_immediately() {
        let deps = deps();
        let job = deps
            .jobs
            .enqueue(kura_events::NewJob::immediate(UserId::new(), "nonsense.job", Payload::empty(), Utc::now(), 3))
            .await
            .unwrap();

        let stats = WorkerStats::default();
        run_job(&deps, &stats, job).await;
        assert_eq!(stats.jobs_dead_lettered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn deep_insight_job_records_a_skipped_inference_run() {
        let deps = deps();
        let job = deps
            .jobs
            .enqueue(kura_events::NewJob::immediate(UserId::new(), job_type::DEEP_INSIGHT, Payload::empty(), Utc::now(), 3))
            .await
            .unwrap();

        let stats = WorkerStats::default();
        run_job(&deps, &stats, job).await;
        assert_eq!(stats.jobs_completed.load(Ordering::Relaxed), 1);
    }

    /// A log-retention store that fails transiently a fixed number of times
    /// before delegating to a real in-memory store, used to drive a job
    /// through the full retry/dead-letter schedule (spec §8.2, scenario S6).
    struct FlakyInferenceRuns {
        failures_remaining: std::sync::atomic::AtomicI32,
        inner: InMemoryInferenceRunStore,
    }

    #[async_trait::async_trait]
    impl kura_events::InferenceRunStore for FlakyInferenceRuns {
        async fn record(&self, run: kura_events::InferenceRun) -> kura_events::EventsResult<()> {
            self.inner.record(run).await
        }

        async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> kura_events::EventsResult<u64> {
            if self.failures_remaining.fetch_sub(1, Ordering::Relaxed) > 0 {
                return Err(kura_events::EventsError::Unavailable("transient retention failure".to_string()));
            }
            self.inner.delete_older_than(cutoff).await
        }
    }

    #[tokio::test]
    async fn retryable_failures_follow_the_2s_4s_8s_then_dead_schedule() {
        let mut deps = deps();
        deps.inference_runs = Arc::new(FlakyInferenceRuns { failures_remaining: std::sync::atomic::AtomicI32::new(4), inner: InMemoryInferenceRunStore::new() });

        let user_id = UserId::new();
        let now = Utc::now();
        let job = deps.jobs.enqueue(kura_events::NewJob::immediate(user_id, job_type::LOG_RETENTION, Payload::empty(), now, 3)).await.unwrap();

        let stats = WorkerStats::default();

        // Attempt 1: fails, retry scheduled ~2s out.
        let claimed = deps.jobs.claim_batch(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        run_job(&deps, &stats, claimed.into_iter().next().unwrap()).await;
        assert_eq!(stats.jobs_retried.load(Ordering::Relaxed), 1);
        assert_eq!(stats.jobs_dead_lettered.load(Ordering::Relaxed), 0);

        // Small margins below absorb the gap between the test's `now` and the
        // `Utc::now()` `run_job` actually schedules against; they're well
        // inside each backoff step so they can't mask a wrong schedule.
        let after_first = deps.jobs.claim_batch(10, now + chrono::Duration::milliseconds(2200)).await.unwrap();
        assert_eq!(after_first.len(), 1, "job should be due again at the 2s backoff mark");
        assert_eq!(after_first[0].attempt, 2);

        // Attempt 2: fails, retry scheduled ~4s out.
        run_job(&deps, &stats, after_first.into_iter().next().unwrap()).await;
        assert_eq!(stats.jobs_retried.load(Ordering::Relaxed), 2);

        let after_second = deps.jobs.claim_batch(10, now + chrono::Duration::milliseconds(6300)).await.unwrap();
        assert_eq!(after_second.len(), 1, "job should be due again at the 4s backoff mark");
        assert_eq!(after_second[0].attempt, 3);

        // Attempt 3: fails, retry scheduled ~8s out.
        run_job(&deps, &stats, after_second.into_iter().next().unwrap()).await;
        assert_eq!(stats.jobs_retried.load(Ordering::Relaxed), 3);
        assert_eq!(stats.jobs_dead_lettered.load(Ordering::Relaxed), 0);

        let after_third = deps.jobs.claim_batch(10, now + chrono::Duration::milliseconds(14_500)).await.unwrap();
        assert_eq!(after_third.len(), 1, "job should be due again at the 8s backoff mark");
        assert_eq!(after_third[0].attempt, 4);

        // Attempt 4: still flaky (failures_remaining started at 4), retries exhausted → dead.
        run_job(&deps, &stats, after_third.into_iter().next().unwrap()).await;
        assert_eq!(stats.jobs_dead_lettered.load(Ordering::Relaxed), 1);
        assert_eq!(stats.jobs_retried.load(Ordering::Relaxed), 3, "no further retry is scheduled once exhausted");

        let dead = deps.jobs.claim_batch(10, now + chrono::Duration::seconds(100)).await.unwrap();
        assert!(dead.is_empty(), "a dead job is never claimable again");
        let _ = job;
    }
}
