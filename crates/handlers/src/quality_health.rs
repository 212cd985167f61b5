//! Quality health handler (spec §4.4.7, §4.6).
//!
//! Thin I/O shell around the pure `kura-quality` pipeline: evaluate
//! invariants, generate and simulate repair proposals, apply the ones the
//! auto-apply gate passes, and close out any previously applied proposal
//! whose issue no longer reproduces. `kura-quality` itself never touches a
//! store — every read-after-write step (apply, verify, close) lives here.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use kura_core::Payload;
use kura_corrections::EXERCISE_CATALOG;
use kura_events::ProjectionWrite;
use kura_quality::{
    auto_apply_decision, autonomy_policy_from_slos, build_fix_applied_event, build_fix_rejected_event, build_issue_closed_event,
    build_quality_projection_data, compute_integrity_slos, compute_quality_score, evaluate_invariants, generate_proposals,
    simulate_and_finalize, status_from_score, InvariantInputs, ProposalState, RepairProposal,
};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome, Registry};

use crate::shared::load_user_context;

pub const DIMENSION: &str = "quality_health";

pub struct QualityHealthHandler {
    allow_tier_a_auto_apply: bool,
    registry: Arc<OnceLock<Registry>>,
}

impl QualityHealthHandler {
    /// `registry` is the cell `register_all` populates once the full
    /// registry this handler is itself a member of has been built —
    /// `Registry` holds no self-reference, so the cell is the only way this
    /// handler can dry-run proposed event batches through the same dispatch
    /// table it's registered against.
    pub fn new(allow_tier_a_auto_apply: bool, registry: Arc<OnceLock<Registry>>) -> Self {
        Self { allow_tier_a_auto_apply, registry }
    }
}

#[async_trait]
impl Handler for QualityHealthHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let Some(registry) = self.registry.get() else {
            return HandlerOutcome::Retryable("quality_health registry not yet initialized".to_string());
        };
        let user_id = invocation.user_id;
        let now = Utc::now();

        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let mut active_events = match ctx.events.query_all(user_id).await {
            Ok(events) => events.into_iter().filter(|e| !user_ctx.retracted.contains(&e.event_id)).collect::<Vec<_>>(),
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };

        let (issues, metrics) = evaluate_invariants(&InvariantInputs { events: &active_events, alias_map: &user_ctx.alias_map });
        let proposals = generate_proposals(&issues, now);
        let known_exercise_ids: HashSet<&str> = EXERCISE_CATALOG.iter().map(|entry| entry.canonical_key).collect();
        let mut proposals = simulate_and_finalize(proposals, registry, &known_exercise_ids, now);

        let mut applied_any = false;
        for proposal in &mut proposals {
            if !matches!(proposal.state, ProposalState::SimulatedSafe | ProposalState::SimulatedRisky) {
                continue;
            }
            let (allowed, reason) = auto_apply_decision(proposal, self.allow_tier_a_auto_apply);
            if allowed {
                if let Err(e) = apply_proposal(ctx, user_id, proposal, now).await {
                    return HandlerOutcome::Retryable(e);
                }
                applied_any = true;
            } else {
                let rejected = build_fix_rejected_event(proposal, reason);
                if let Err(e) = ctx.append_event(rejected.into_new_event(user_id, now)).await {
                    return HandlerOutcome::Retryable(e.to_string());
                }
                proposal.state = ProposalState::AutoApplyRejected;
                proposal.state_history.push(kura_quality::StateHistoryEntry { state: proposal.state, at: now });
            }
        }

        let (final_issues, final_metrics) = if applied_any {
            active_events = match ctx.events.query_all(user_id).await {
                Ok(events) => events.into_iter().filter(|e| !user_ctx.retracted.contains(&e.event_id)).collect::<Vec<_>>(),
                Err(e) => return HandlerOutcome::Retryable(e.to_string()),
            };
            evaluate_invariants(&InvariantInputs { events: &active_events, alias_map: &user_ctx.alias_map })
        } else {
            (issues, metrics)
        };

        for proposal in &mut proposals {
            if proposal.state != ProposalState::Applied {
                continue;
            }
            let still_open = final_issues.iter().any(|issue| issue.issue_id == proposal.issue_id);
            if still_open {
                continue;
            }
            let closed = build_issue_closed_event(proposal);
            if let Err(e) = ctx.append_event(closed.into_new_event(user_id, now)).await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            proposal.state = ProposalState::VerifiedClosed;
            proposal.state_history.push(kura_quality::StateHistoryEntry { state: proposal.state, at: now });
        }

        let unresolved_pct = final_metrics.get("set_logged_unresolved_pct").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        let unresolved_sample_count = final_metrics.get("set_logged_total").and_then(serde_json::Value::as_u64).unwrap_or(0) as usize;
        let integrity_slos = compute_integrity_slos(&active_events, unresolved_pct, unresolved_sample_count, now);
        // Calibration status (extraction/catalog confidence tracking) has no
        // dedicated signal in this port; treated as always healthy, leaving
        // integrity SLOs as the sole driver of autonomy scope.
        let autonomy_policy = autonomy_policy_from_slos(&integrity_slos, "healthy");

        let quality_score = compute_quality_score(&final_issues);
        let status = status_from_score(quality_score, &final_issues);
        let projection = build_quality_projection_data(now, &final_issues, final_metrics, quality_score, status, &proposals, integrity_slos, autonomy_policy);

        let data = serde_json::to_value(&projection).unwrap_or(serde_json::json!({}));
        let last_event_id = active_events.last().map(|e| e.event_id);
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> serde_json::Value {
        let Some(rows) = projection_data.get_array("rows") else { return serde_json::Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return serde_json::json!({}) };

        let applied_count = data
            .get("proposals")
            .and_then(serde_json::Value::as_array)
            .map(|proposals| proposals.iter().filter(|p| p.get("state").and_then(serde_json::Value::as_str) == Some("applied")).count())
            .unwrap_or(0);

        serde_json::json!({
            "quality_status": data.get("status"),
            "quality_score": data.get("quality_score"),
            "quality_open_issues": data.get("open_issue_count"),
            "quality_repair_applied": applied_count,
            "quality_integrity_slo_status": data.get("integrity_slos").and_then(|s| s.get("status")),
            "quality_autonomy_requires_confirmation": data.get("autonomy_policy").and_then(|p| p.get("requires_confirmation")),
        })
    }
}

async fn apply_proposal(ctx: &HandlerContext, user_id: kura_core::UserId, proposal: &mut RepairProposal, now: chrono::DateTime<Utc>) -> Result<(), String> {
    for event in proposal.proposed_event_batch.clone() {
        ctx.append_event(event.into_new_event(user_id, now)).await.map_err(|e| e.to_string())?;
    }
    let applied = build_fix_applied_event(proposal);
    ctx.append_event(applied.into_new_event(user_id, now)).await.map_err(|e| e.to_string())?;
    proposal.state = ProposalState::Applied;
    proposal.state_history.push(kura_quality::StateHistoryEntry { state: proposal.state, at: now });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    use async_trait::async_trait;
    use kura_core::UserId;
    use kura_events::{Event, EventsResult, InferenceRun, NewEvent, Projection};
    use serde_json::json;

    /// Minimal `RwLock<HashMap<...>>` test doubles for the three store
    /// traits — enough to drive a handler through `handle()` end to end
    /// without a real backend, mirroring the shape of a from-scratch
    /// in-memory event store: one lock-guarded map per concern, no
    /// transactions or concurrency control beyond the lock itself.
    #[derive(Default)]
    struct MemoryEvents {
        by_user: RwLock<HashMap<UserId, Vec<Event>>>,
    }

    #[async_trait]
    impl kura_events::EventStore for MemoryEvents {
        async fn append(&self, event: NewEvent) -> EventsResult<Event> {
            let stored = Event {
                event_id: kura_core::EventId::new(),
                user_id: event.user_id,
                timestamp: event.timestamp,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
            };
            self.by_user.write().unwrap().entry(event.user_id).or_default().push(stored.clone());
            Ok(stored)
        }

        async fn query_by_type(&self, user_id: UserId, event_types: &[&str]) -> EventsResult<Vec<Event>> {
            let guard = self.by_user.read().unwrap();
            let events = guard.get(&user_id).cloned().unwrap_or_default();
            Ok(if event_types.is_empty() {
                events
            } else {
                events.into_iter().filter(|e| event_types.contains(&e.event_type.as_str())).collect()
            })
        }

        async fn query_all(&self, user_id: UserId) -> EventsResult<Vec<Event>> {
            Ok(self.by_user.read().unwrap().get(&user_id).cloned().unwrap_or_default())
        }

        async fn find(&self, event_id: kura_core::EventId) -> EventsResult<Option<Event>> {
            let guard = self.by_user.read().unwrap();
            Ok(guard.values().flatten().find(|e| e.event_id == event_id).cloned())
        }

        async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
            self.by_user.write().unwrap().remove(&user_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryProjections {
        rows: RwLock<HashMap<(UserId, String, String), Projection>>,
    }

    #[async_trait]
    impl kura_events::ProjectionStore for MemoryProjections {
        async fn upsert(&self, write: kura_events::ProjectionWrite) -> EventsResult<Projection> {
            let key = (write.user_id, write.projection_type.clone(), write.key.clone());
            let mut guard = self.rows.write().unwrap();
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
            Ok(self.rows.read().unwrap().get(&(user_id, projection_type.to_string(), key.to_string())).cloned())
        }

        async fn list_by_type(&self, user_id: UserId, projection_type: &str) -> EventsResult<Vec<Projection>> {
            Ok(self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|p| p.user_id == user_id && p.projection_type == projection_type)
                .cloned()
                .collect())
        }

        async fn delete(&self, user_id: UserId, projection_type: &str, key: &str) -> EventsResult<()> {
            self.rows.write().unwrap().remove(&(user_id, projection_type.to_string(), key.to_string()));
            Ok(())
        }

        async fn hard_delete_user(&self, user_id: UserId) -> EventsResult<()> {
            self.rows.write().unwrap().retain(|(uid, _, _), _| *uid != user_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryInferenceRuns {
        runs: RwLock<Vec<InferenceRun>>,
    }

    #[async_trait]
    impl kura_events::InferenceRunStore for MemoryInferenceRuns {
        async fn record(&self, run: InferenceRun) -> EventsResult<()> {
            self.runs.write().unwrap().push(run);
            Ok(())
        }

        async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> EventsResult<u64> {
            let mut guard = self.runs.write().unwrap();
            let before = guard.len();
            guard.retain(|r| r.completed_at >= cutoff);
            Ok((before - guard.len()) as u64)
        }
    }

    #[derive(Default)]
    struct MemoryJobs {
        enqueued: RwLock<Vec<kura_events::NewJob>>,
    }

    #[async_trait]
    impl kura_events::JobQueue for MemoryJobs {
        async fn enqueue(&self, job: kura_events::NewJob) -> EventsResult<kura_events::Job> {
            self.enqueued.write().unwrap().push(job.clone());
            Ok(kura_events::Job {
                job_id: kura_core::JobId::new(),
                user_id: job.user_id,
                job_type: job.job_type,
                payload: job.payload,
                status: kura_events::JobStatus::Pending,
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
        async fn claim_batch(&self, _batch_size: i64, _now: chrono::DateTime<Utc>) -> EventsResult<Vec<kura_events::Job>> {
            Ok(vec![])
        }
        async fn mark_completed(&self, _job_id: kura_core::JobId) -> EventsResult<()> {
            Ok(())
        }
        async fn mark_retry_or_dead(&self, _job_id: kura_core::JobId, _error_message: &str, _next_scheduled_for: chrono::DateTime<Utc>) -> EventsResult<()> {
            Ok(())
        }
        async fn mark_dead(&self, _job_id: kura_core::JobId, _error_message: &str) -> EventsResult<()> {
            Ok(())
        }
        async fn hard_delete_user(&self, _user_id: UserId) -> EventsResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryNotify {
        notifications: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl kura_events::NotifyBus for MemoryNotify {
        async fn notify(&self) -> EventsResult<()> {
            self.notifications.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        async fn wait(&self, _timeout: std::time::Duration) {}
    }

    fn memory_context() -> HandlerContext {
        HandlerContext {
            events: Arc::new(MemoryEvents::default()),
            projections: Arc::new(MemoryProjections::default()),
            inference_runs: Arc::new(MemoryInferenceRuns::default()),
            jobs: Arc::new(MemoryJobs::default()),
            notify: Arc::new(MemoryNotify::default()),
            schema_capabilities: Arc::new(kura_store::InMemorySchemaCapabilities::new()),
            max_retries: 3,
        }
    }

    fn find_quality_handler(registry: &Registry) -> Arc<dyn kura_registry::Handler> {
        registry
            .handlers_for("set.logged")
            .iter()
            .find(|h| h.dimension() == DIMENSION)
            .cloned()
            .unwrap_or_else(|| panic!("quality_health not registered against set.logged"))
    }

    #[tokio::test]
    async fn missing_timezone_yields_an_open_issue_and_a_scored_projection() {
        let cell = crate::register_all(&crate::HandlersConfig::default());
        let registry = cell.get().expect("registry built");
        let handler = find_quality_handler(registry);

        let ctx = memory_context();
        let user_id = UserId::new();
        let now = Utc::now();
        let logged = ctx
            .events
            .append(NewEvent::new(
                user_id,
                now,
                "set.logged",
                Payload::new(json!({"exercise_id": "barbell_back_squat", "weight_kg": 100.0, "reps": 5})),
                Payload::empty(),
            ))
            .await
            .unwrap();

        let outcome = handler
            .handle(&ctx, &HandlerInvocation { user_id, event_id: logged.event_id, event_type: "set.logged".to_string() })
            .await;
        assert!(matches!(outcome, HandlerOutcome::Completed));

        let projection = ctx.projections.get(user_id, DIMENSION, "overview").await.unwrap().expect("projection written");
        let data = projection.data.as_value();
        assert!(data["quality_score"].as_f64().is_some());
        assert!(data["status"].is_string());
        assert!(data["proposals"].is_array());
        assert!(data["integrity_slos"]["status"].is_string());
        assert!(data["autonomy_policy"]["status"].is_string());
    }

    #[test]
    fn manifest_contribution_reads_the_real_projection_field_names() {
        let handler = QualityHealthHandler::new(true, Arc::new(OnceLock::new()));
        let rows = json!({"rows": [{"key": "overview", "data": {
            "status": "fair",
            "quality_score": 72.5,
            "open_issue_count": 2,
            "proposals": [{"state": "applied"}, {"state": "proposed"}],
            "integrity_slos": {"status": "healthy"},
            "autonomy_policy": {"requires_confirmation": true},
        }}]});
        let contribution = handler.manifest_contribution(&Payload::new(rows));
        assert_eq!(contribution["quality_status"], json!("fair"));
        assert_eq!(contribution["quality_score"], json!(72.5));
        assert_eq!(contribution["quality_open_issues"], json!(2));
        assert_eq!(contribution["quality_repair_applied"], json!(1));
        assert_eq!(contribution["quality_integrity_slo_status"], json!("healthy"));
        assert_eq!(contribution["quality_autonomy_requires_confirmation"], json!(true));
    }

    #[test]
    fn manifest_contribution_is_empty_object_with_no_rows() {
        let handler = QualityHealthHandler::new(true, Arc::new(OnceLock::new()));
        assert_eq!(handler.manifest_contribution(&Payload::new(json!({"rows": []}))), json!({}));
    }
}
