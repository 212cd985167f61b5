//! The handler trait every C4 projection builder implements (spec §4.2, §4.4).

use async_trait::async_trait;
use kura_core::{EventId, Payload, UserId};
use kura_events::{EventStore, InferenceRunStore, JobQueue, NotifyBus, ProjectionStore, SchemaCapabilityStore};
use serde_json::Value;
use std::sync::Arc;

/// What the router runs a handler against (spec §4.4 "shared contract" step 1).
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub user_id: UserId,
    pub event_id: EventId,
    pub event_type: String,
}

/// Collaborators every handler needs: the event log and projection store.
/// Handlers never hold a reference across a suspension that isn't rooted in
/// the worker's per-job transaction (spec §4.5 "Suspension points") — in
/// practice this means `Arc<dyn ...>` trait objects over a shared pool,
/// the same blanket-impl-over-`Arc<B>` shape used for every bus trait here.
#[derive(Clone)]
pub struct HandlerContext {
    pub events: Arc<dyn EventStore>,
    pub projections: Arc<dyn ProjectionStore>,
    pub inference_runs: Arc<dyn InferenceRunStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub notify: Arc<dyn NotifyBus>,
    /// Probe for whether an optional relation exists in the deployed schema
    /// (spec §A.6), so a handler with an optional enrichment path can note a
    /// `schema_capabilities` gap instead of failing the recompute.
    pub schema_capabilities: Arc<dyn SchemaCapabilityStore>,
    /// Default retry budget for jobs this handler enqueues (a Tier-A repair's
    /// recompute fan-out), mirroring `MAX_RETRIES` (spec §6.4).
    pub max_retries: i32,
}

impl HandlerContext {
    /// Append a handler-synthesized event (a Tier-A repair) and enqueue its
    /// recompute the same way any other event's append does (spec §2
    /// "synthesize and apply Tier-A repairs ... triggering further
    /// recomputes").
    pub async fn append_event(&self, event: kura_events::NewEvent) -> kura_events::EventsResult<kura_events::Event> {
        kura_events::append_and_enqueue(self.events.as_ref(), self.jobs.as_ref(), self.notify.as_ref(), event, self.max_retries).await
    }
}

/// Outcome of one handler invocation, classified per spec §7/§9's
/// re-architecture table ("Return a sum type instead of raising").
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Completed,
    Retryable(String),
    Permanent(String),
}

impl HandlerOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A projection builder registered against one or more event types.
///
/// Implementors fully recompute their projection(s) from filtered event
/// history on every invocation (spec §3.2 "Projection idempotence") — there
/// is no incremental-update path.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable dimension name, used as the registry key and, by convention,
    /// as the `projection_type` for single-key dimensions.
    fn dimension(&self) -> &'static str;

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome;

    /// Summarize this dimension's current projection rows for inclusion in
    /// the user_profile manifest (spec §4.2 "manifest_contribution",
    /// §4.4.8). Default: no contribution (most dimensions are summarized by
    /// user_profile reading their `data_quality` block directly instead).
    fn manifest_contribution(&self, _projection_data: &Payload) -> Value {
        Value::Null
    }
}
