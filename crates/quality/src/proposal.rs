//! Repair proposal generation, the deterministic simulate bridge, and the
//! proposal state machine (spec §4.6.2–§4.6.4).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use kura_core::{Payload, ProposalId};
use kura_corrections::{build_repair_provenance, resolve_exercise_term, summarize_repair_provenance, CatalogMatch, RepairProvenance, RepairProvenanceSummary};
use kura_events::NewEvent;
use kura_registry::Registry;
use serde_json::{json, Value};

use crate::issue::Issue;

/// Only deterministic sources may drive an auto-applied repair (spec §4.6.2,
/// §4.6.5) — catalog variant/key-slug matches, never a slug fallback guess.
pub const DETERMINISTIC_PROPOSAL_SOURCES: &[&str] = &["catalog_variant_exact", "catalog_key_slug_match"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    A,
    B,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalState {
    Proposed,
    SimulatedSafe,
    SimulatedRisky,
    Rejected,
    Applied,
    AutoApplyRejected,
    VerifiedClosed,
}

impl ProposalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::SimulatedSafe => "simulated_safe",
            Self::SimulatedRisky => "simulated_risky",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::AutoApplyRejected => "auto_apply_rejected",
            Self::VerifiedClosed => "verified_closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateHistoryEntry {
    pub state: ProposalState,
    pub at: DateTime<Utc>,
}

/// A proposed event batch; not yet persisted. `event_type`/`data`/`metadata`
/// mirror `NewEvent` but omit `user_id`/`timestamp`, which the caller binds
/// when turning a proposal into a write.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    pub event_type: String,
    pub data: Value,
    pub metadata: Value,
}

impl ProposedEvent {
    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata.get("idempotency_key").and_then(Value::as_str)
    }

    pub fn into_new_event(self, user_id: kura_core::UserId, timestamp: DateTime<Utc>) -> NewEvent {
        NewEvent::new(user_id, timestamp, self.event_type, Payload::new(self.data), Payload::new(self.metadata))
    }
}

#[derive(Debug, Clone)]
pub struct RepairProposal {
    pub proposal_id: ProposalId,
    pub issue_id: String,
    pub invariant_id: &'static str,
    pub issue_type: &'static str,
    pub tier: Tier,
    pub state: ProposalState,
    pub safe_for_apply: bool,
    pub rationale: String,
    pub assumptions: Vec<String>,
    pub repair_provenance_entries: Vec<RepairProvenance>,
    pub repair_provenance_summary: RepairProvenanceSummary,
    pub proposed_at: DateTime<Utc>,
    pub proposed_event_batch: Vec<ProposedEvent>,
    pub candidate_sources: Vec<&'static str>,
    pub unmatched_terms: Vec<String>,
    pub simulate: Option<SimulationResult>,
    pub state_history: Vec<StateHistoryEntry>,
}

impl RepairProposal {
    fn base(issue: &Issue, evaluated_at: DateTime<Utc>, tier: Tier, rationale: impl Into<String>, assumptions: Vec<String>, provenance: Vec<RepairProvenance>) -> Self {
        let summary = summarize_repair_provenance(&provenance);
        Self {
            proposal_id: ProposalId::for_issue(&issue.issue_id),
            issue_id: issue.issue_id.clone(),
            invariant_id: issue.invariant_id,
            issue_type: issue.issue_type,
            tier,
            state: ProposalState::Proposed,
            safe_for_apply: false,
            rationale: rationale.into(),
            assumptions,
            repair_provenance_entries: provenance,
            repair_provenance_summary: summary,
            proposed_at: evaluated_at,
            proposed_event_batch: Vec::new(),
            candidate_sources: Vec::new(),
            unmatched_terms: Vec::new(),
            simulate: None,
            state_history: vec![StateHistoryEntry { state: ProposalState::Proposed, at: evaluated_at }],
        }
    }
}

fn propose_inv001(issue: &Issue, evaluated_at: DateTime<Utc>) -> RepairProposal {
    let top_terms = issue.metrics.get("top_unresolved_terms_with_counts").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut events = Vec::new();
    let mut unmatched_terms = Vec::new();
    let mut candidate_sources = Vec::new();
    let mut provenance_entries = Vec::new();

    for item in &top_terms {
        let Some(term) = item.get("term").and_then(Value::as_str) else { continue };
        let term = term.trim().to_lowercase();
        if term.is_empty() || term == "<missing_exercise>" {
            continue;
        }

        let matched = resolve_exercise_term(&term);
        let (source, provenance) = match &matched {
            CatalogMatch::VariantExact { .. } => (
                "catalog_variant_exact",
                build_repair_provenance("inferred", 0.95, "exercise_session", "Catalog variant exact match for unresolved alias."),
            ),
            CatalogMatch::KeySlug { .. } => (
                "catalog_key_slug_match",
                build_repair_provenance("inferred", 0.9, "exercise_session", "Catalog key slug match for unresolved alias."),
            ),
            CatalogMatch::SlugFallback { canonical_key } if canonical_key.is_empty() => {
                unmatched_terms.push(term.clone());
                continue;
            }
            CatalogMatch::SlugFallback { .. } => (
                "slug_fallback",
                build_repair_provenance("estimated", 0.55, "exercise_session", "Slug fallback guess for unresolved alias."),
            ),
        };

        candidate_sources.push(source);
        let canonical = matched.canonical_key().to_string();
        let provenance_value = serde_json::to_value(&provenance).unwrap_or(Value::Null);
        provenance_entries.push(provenance);

        events.push(ProposedEvent {
            event_type: "exercise.alias_created".to_string(),
            data: json!({
                "alias": term,
                "exercise_id": canonical,
                "confidence": "inferred",
                "repair_provenance": provenance_value,
            }),
            metadata: json!({
                "source": "quality_health",
                "agent": "repair_planner",
                "session_id": format!("quality:{}", issue.issue_id),
                "idempotency_key": format!("repair-{}-{term}-{canonical}", issue.issue_id),
            }),
        });
    }

    let has_fallback = candidate_sources.contains(&"slug_fallback");
    let tier = if has_fallback { Tier::B } else { Tier::A };
    let assumptions = if has_fallback {
        vec!["Some exercise mappings use slug fallback and need confirmation.".to_string()]
    } else {
        Vec::new()
    };

    let mut proposal = RepairProposal::base(
        issue,
        evaluated_at,
        tier,
        "Map unresolved exercise terms to canonical exercise_id values to restore identity consistency (INV-001).",
        assumptions,
        provenance_entries,
    );
    proposal.proposed_event_batch = events;
    proposal.candidate_sources = candidate_sources;
    proposal.unmatched_terms = unmatched_terms;
    proposal
}

fn propose_inv003(issue: &Issue, evaluated_at: DateTime<Utc>) -> RepairProposal {
    let provenance = build_repair_provenance("estimated", 0.45, "session", "Timezone fallback requires confirmation from user.");
    let provenance_value = serde_json::to_value(&provenance).unwrap_or(Value::Null);

    let mut proposal = RepairProposal::base(
        issue,
        evaluated_at,
        Tier::B,
        "Set explicit timezone preference to prevent schedule/date drift (INV-003).",
        vec!["Default timezone assumed as UTC until user confirms.".to_string()],
        vec![provenance],
    );
    proposal.proposed_event_batch = vec![ProposedEvent {
        event_type: "preference.set".to_string(),
        data: json!({"key": "timezone", "value": "UTC", "repair_provenance": provenance_value}),
        metadata: json!({
            "source": "quality_health",
            "agent": "repair_planner",
            "session_id": format!("quality:{}", issue.issue_id),
            "idempotency_key": format!("repair-{}-timezone-utc", issue.issue_id),
        }),
    }];
    proposal
}

/// Generate proposals for the two invariants that currently have a repair
/// generator (spec §4.6.2: "the mechanism is open for extension").
pub fn generate_proposals(issues: &[Issue], evaluated_at: DateTime<Utc>) -> Vec<RepairProposal> {
    issues
        .iter()
        .filter_map(|issue| match issue.issue_type {
            "unresolved_exercise_identity" => Some(propose_inv001(issue, evaluated_at)),
            "timezone_missing" => Some(propose_inv003(issue, evaluated_at)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SimWarning {
    pub event_index: usize,
    pub field: String,
    pub message: String,
    pub severity: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpactChange {
    Update,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProjectionImpact {
    pub projection_type: String,
    pub key: String,
    pub change: ImpactChange,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub event_count: usize,
    pub warnings: Vec<SimWarning>,
    pub projection_impacts: Vec<ProjectionImpact>,
    pub notes: Vec<String>,
    pub engine: &'static str,
    pub target_endpoint: &'static str,
}

pub const SIMULATE_ENDPOINT: &str = "/v1/events/simulate";

fn projection_key_for_event(projection_type: &str, data: &Value) -> String {
    const OVERVIEW_KEY_PROJECTIONS: &[&str] = &[
        "body_composition",
        "causal_inference",
        "nutrition",
        "quality_health",
        "readiness_inference",
        "recovery",
        "semantic_memory",
        "training_timeline",
    ];
    if projection_type == "user_profile" {
        return "me".to_string();
    }
    if OVERVIEW_KEY_PROJECTIONS.contains(&projection_type) {
        return "overview".to_string();
    }
    if projection_type == "exercise_progression" || projection_type == "strength_inference" {
        let key = data.get("exercise_id").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
        return if key.is_empty() { "*".to_string() } else { key };
    }
    if projection_type == "training_plan" {
        let key = data.get("plan_id").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
        return if key.is_empty() { "default".to_string() } else { key };
    }
    "*".to_string()
}

/// Deterministic simulate bridge (spec §4.6.3): resolves which handlers
/// would fire for a proposed event batch via the registry, without
/// persisting anything or computing projection contents.
pub fn simulate_event_batch(events: &[ProposedEvent], registry: &Registry, known_exercise_ids: &HashSet<&str>) -> SimulationResult {
    let mut warnings = Vec::new();
    let mut notes = Vec::new();
    let mut impact_map: std::collections::BTreeMap<(String, String), ProjectionImpact> = std::collections::BTreeMap::new();

    for (index, event) in events.iter().enumerate() {
        if event.event_type == "exercise.alias_created" {
            let alias = event.data.get("alias").and_then(Value::as_str).unwrap_or("").trim();
            let exercise_id = event.data.get("exercise_id").and_then(Value::as_str).unwrap_or("").trim();
            if alias.is_empty() {
                warnings.push(SimWarning { event_index: index, field: "data.alias".to_string(), message: "exercise.alias_created is missing alias".to_string(), severity: "warning" });
            }
            if exercise_id.is_empty() {
                warnings.push(SimWarning { event_index: index, field: "data.exercise_id".to_string(), message: "exercise.alias_created is missing exercise_id".to_string(), severity: "warning" });
            } else if !known_exercise_ids.contains(exercise_id) {
                warnings.push(SimWarning {
                    event_index: index,
                    field: "data.exercise_id".to_string(),
                    message: format!("exercise_id '{exercise_id}' is not in the global exercise catalog"),
                    severity: "warning",
                });
            }
        } else if event.event_type == "preference.set" {
            let key = event.data.get("key").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
            if key.is_empty() {
                warnings.push(SimWarning { event_index: index, field: "data.key".to_string(), message: "preference.set is missing key".to_string(), severity: "warning" });
            }
            let value = event.data.get("value").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
            if (key == "timezone" || key == "time_zone") && value == "utc" {
                notes.push("Timezone proposal uses UTC assumption; confirm with user before apply.".to_string());
            }
        }

        let handlers = registry.handlers_for(&event.event_type);
        if handlers.is_empty() {
            notes.push(format!("No projection handlers matched simulated event_type '{}'.", event.event_type));
            continue;
        }

        for handler in handlers {
            let projection_type = handler.dimension().to_string();
            let key = projection_key_for_event(&projection_type, &event.data);
            let change = if key == "*" { ImpactChange::Unknown } else { ImpactChange::Update };
            let reason = format!("event_type '{}' routes to handler '{}'", event.event_type, projection_type);
            let entry = impact_map.entry((projection_type.clone(), key.clone())).or_insert_with(|| ProjectionImpact {
                projection_type,
                key,
                change: change.clone(),
                reasons: Vec::new(),
            });
            entry.reasons.push(reason);
            if change == ImpactChange::Unknown {
                entry.change = ImpactChange::Unknown;
            }
        }
    }

    SimulationResult {
        event_count: events.len(),
        warnings,
        projection_impacts: impact_map.into_values().collect(),
        notes,
        engine: "worker_simulate_bridge_v1",
        target_endpoint: SIMULATE_ENDPOINT,
    }
}

/// `proposed -> {simulated_safe, simulated_risky, rejected}` (spec §4.6.4).
pub fn finalize_proposal_state(proposal: &mut RepairProposal, simulation: SimulationResult, evaluated_at: DateTime<Utc>) {
    let has_unknown_impacts = simulation.projection_impacts.iter().any(|i| i.change == ImpactChange::Unknown);

    let state = if proposal.proposed_event_batch.is_empty() {
        ProposalState::Rejected
    } else if !simulation.warnings.is_empty() || has_unknown_impacts || proposal.tier != Tier::A {
        ProposalState::SimulatedRisky
    } else {
        ProposalState::SimulatedSafe
    };

    proposal.safe_for_apply = state == ProposalState::SimulatedSafe;
    proposal.simulate = Some(simulation);
    proposal.state = state;
    proposal.state_history.push(StateHistoryEntry { state, at: evaluated_at });
}

/// Run every proposal through the simulate bridge and finalize its state
/// (spec §4.6.3+§4.6.4, the `_build_simulated_repair_proposals` pipeline).
pub fn simulate_and_finalize(mut proposals: Vec<RepairProposal>, registry: &Registry, known_exercise_ids: &HashSet<&str>, evaluated_at: DateTime<Utc>) -> Vec<RepairProposal> {
    for proposal in &mut proposals {
        let simulation = simulate_event_batch(&proposal.proposed_event_batch, registry, known_exercise_ids);
        finalize_proposal_state(proposal, simulation, evaluated_at);
    }
    proposals
}

pub(crate) fn confidence_band(proposal: &RepairProposal) -> &'static str {
    let by_band = &proposal.repair_provenance_summary.by_confidence_band;
    if by_band.get("low").copied().unwrap_or(0) > 0 {
        "low"
    } else if by_band.get("medium").copied().unwrap_or(0) > 0 {
        "medium"
    } else if by_band.get("high").copied().unwrap_or(0) > 0 {
        "high"
    } else {
        "unknown"
    }
}

/// Mean confidence across a proposal's provenance entries, for projection
/// display purposes (the auto-apply gate itself only consults the band).
pub(crate) fn mean_confidence(proposal: &RepairProposal) -> f64 {
    let entries = &proposal.repair_provenance_entries;
    if entries.is_empty() {
        return 0.0;
    }
    let sum: f64 = entries.iter().map(|e| e.confidence).sum();
    (sum / entries.len() as f64 * 1000.0).round() / 1000.0
}

/// The dominant candidate source for display, or `"n/a"` for proposal types
/// (like INV-003) that don't resolve via the exercise catalog.
pub(crate) fn dominant_source(proposal: &RepairProposal) -> &'static str {
    proposal.candidate_sources.first().copied().unwrap_or("n/a")
}

fn has_deterministic_source(proposal: &RepairProposal) -> bool {
    if proposal.issue_type != "unresolved_exercise_identity" {
        return false;
    }
    !proposal.candidate_sources.is_empty() && proposal.candidate_sources.iter().all(|s| DETERMINISTIC_PROPOSAL_SOURCES.contains(s))
}

/// Reject codes for the auto-apply policy gate (spec §4.6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoApplyReason {
    AutonomyThrottled,
    TierNotA,
    StateNotSimulatedSafe,
    WarningsPresent,
    UnknownProjectionImpacts,
    NonDeterministicSource,
    LowConfidenceRepair,
    EmptyEventBatch,
    PolicyPass,
}

impl AutoApplyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutonomyThrottled => "autonomy_throttled",
            Self::TierNotA => "tier_not_a",
            Self::StateNotSimulatedSafe => "state_not_simulated_safe",
            Self::WarningsPresent => "warnings_present",
            Self::UnknownProjectionImpacts => "unknown_projection_impacts",
            Self::NonDeterministicSource => "non_deterministic_source",
            Self::LowConfidenceRepair => "low_confidence_repair",
            Self::EmptyEventBatch => "empty_event_batch",
            Self::PolicyPass => "policy_pass",
        }
    }
}

pub const AUTO_APPLY_POLICY_GATE: &str = "tier_a_only_and_state_simulated_safe_and_no_warnings_and_no_unknown_impacts_and_deterministic_source";
pub const AUTO_APPLY_POLICY_VERSION: &str = "phase_2_tier_a_v1";

/// Tier-A auto-apply is intentionally not gated by SLO health (spec §4.6.5)
/// — `allow_tier_a_auto_apply` is only `false` while the agent layer itself
/// is throttled for an unrelated reason, never derived from SLO status.
pub fn auto_apply_decision(proposal: &RepairProposal, allow_tier_a_auto_apply: bool) -> (bool, AutoApplyReason) {
    if !allow_tier_a_auto_apply {
        return (false, AutoApplyReason::AutonomyThrottled);
    }
    if proposal.tier != Tier::A {
        return (false, AutoApplyReason::TierNotA);
    }
    if proposal.state != ProposalState::SimulatedSafe {
        return (false, AutoApplyReason::StateNotSimulatedSafe);
    }
    let Some(simulation) = &proposal.simulate else {
        return (false, AutoApplyReason::StateNotSimulatedSafe);
    };
    if !simulation.warnings.is_empty() {
        return (false, AutoApplyReason::WarningsPresent);
    }
    if simulation.projection_impacts.iter().any(|i| i.change == ImpactChange::Unknown) {
        return (false, AutoApplyReason::UnknownProjectionImpacts);
    }
    if !has_deterministic_source(proposal) {
        return (false, AutoApplyReason::NonDeterministicSource);
    }
    if confidence_band(proposal) == "low" {
        return (false, AutoApplyReason::LowConfidenceRepair);
    }
    if proposal.proposed_event_batch.is_empty() {
        return (false, AutoApplyReason::EmptyEventBatch);
    }
    (true, AutoApplyReason::PolicyPass)
}

/// Deterministic, collision-resistant-enough-for-idempotency-keys hash
/// (FNV-1a). Not a cryptographic hash — used only to keep audit event
/// idempotency keys short and stable across re-evaluation, mirroring the
/// original's truncated sha1 digest without pulling in a crypto crate this
/// workspace otherwise has no use for.
fn stable_suffix(seed: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in seed.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Build the `quality.fix.applied` audit event for a proposal that passed
/// the auto-apply gate (spec §4.6.6 step 1).
pub fn build_fix_applied_event(proposal: &RepairProposal) -> ProposedEvent {
    let repair_idempotency_keys: Vec<&str> = proposal.proposed_event_batch.iter().filter_map(|e| e.idempotency_key()).collect();
    let provenance_summary = serde_json::to_value(&proposal.repair_provenance_summary).unwrap_or(Value::Null);
    ProposedEvent {
        event_type: "quality.fix.applied".to_string(),
        data: json!({
            "proposal_id": proposal.proposal_id.as_str(),
            "issue_id": proposal.issue_id,
            "invariant_id": proposal.invariant_id,
            "issue_type": proposal.issue_type,
            "tier": proposal.tier.as_str(),
            "policy_gate": AUTO_APPLY_POLICY_GATE,
            "policy_version": AUTO_APPLY_POLICY_VERSION,
            "repair_event_count": repair_idempotency_keys.len(),
            "repair_event_idempotency_keys": repair_idempotency_keys,
            "repair_provenance_summary": provenance_summary,
        }),
        metadata: json!({
            "source": "quality_health",
            "agent": "repair_autopilot",
            "session_id": format!("quality:{}", proposal.issue_id),
            "idempotency_key": format!("quality-fix-applied-{}", stable_suffix(proposal.proposal_id.as_str())),
        }),
    }
}

/// Build the `quality.fix.rejected` audit event for a proposal the gate
/// turned down (spec §4.6.4 `simulated_safe -> auto_apply_rejected`).
pub fn build_fix_rejected_event(proposal: &RepairProposal, reason: AutoApplyReason) -> ProposedEvent {
    let simulation_warnings = proposal.simulate.as_ref().map(|s| s.warnings.len()).unwrap_or(0);
    let has_unknown_impacts = proposal
        .simulate
        .as_ref()
        .map(|s| s.projection_impacts.iter().any(|i| i.change == ImpactChange::Unknown))
        .unwrap_or(false);
    let provenance_summary = serde_json::to_value(&proposal.repair_provenance_summary).unwrap_or(Value::Null);
    let seed = format!("{}:{}", proposal.proposal_id.as_str(), reason.as_str());
    ProposedEvent {
        event_type: "quality.fix.rejected".to_string(),
        data: json!({
            "proposal_id": proposal.proposal_id.as_str(),
            "issue_id": proposal.issue_id,
            "invariant_id": proposal.invariant_id,
            "issue_type": proposal.issue_type,
            "tier": proposal.tier.as_str(),
            "proposal_state": proposal.state.as_str(),
            "reason_code": reason.as_str(),
            "warnings_count": simulation_warnings,
            "unknown_projection_impacts": has_unknown_impacts,
            "policy_gate": AUTO_APPLY_POLICY_GATE,
            "policy_version": AUTO_APPLY_POLICY_VERSION,
            "repair_provenance_summary": provenance_summary,
        }),
        metadata: json!({
            "source": "quality_health",
            "agent": "repair_autopilot",
            "session_id": format!("quality:{}", proposal.issue_id),
            "idempotency_key": format!("quality-fix-rejected-{}", stable_suffix(&seed)),
        }),
    }
}

/// Build the `quality.issue.closed` event once re-evaluation confirms the
/// originating issue no longer reproduces (spec §4.6.6 step 3).
pub fn build_issue_closed_event(proposal: &RepairProposal) -> ProposedEvent {
    ProposedEvent {
        event_type: "quality.issue.closed".to_string(),
        data: json!({
            "proposal_id": proposal.proposal_id.as_str(),
            "issue_id": proposal.issue_id,
            "invariant_id": proposal.invariant_id,
            "issue_type": proposal.issue_type,
            "closed_by": "auto_apply_verification",
            "policy_version": AUTO_APPLY_POLICY_VERSION,
        }),
        metadata: json!({
            "source": "quality_health",
            "agent": "repair_autopilot",
            "session_id": format!("quality:{}", proposal.issue_id),
            "idempotency_key": format!("quality-issue-closed-{}", stable_suffix(proposal.proposal_id.as_str())),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{InvariantInputs, evaluate_invariants};
    use kura_corrections::AliasMap;
    use kura_core::{Payload, UserId};
    use kura_events::Event;
    use kura_registry::{DimensionMeta, Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop(&'static str);

    #[async_trait]
    impl Handler for Noop {
        fn dimension(&self) -> &'static str {
            self.0
        }
        async fn handle(&self, _ctx: &HandlerContext, _invocation: &HandlerInvocation) -> HandlerOutcome {
            HandlerOutcome::Completed
        }
    }

    fn registry() -> Registry {
        Registry::builder().register(
            &["exercise.alias_created"],
            Arc::new(Noop("exercise_progression")),
            DimensionMeta {
                name: "exercise_progression",
                description: "",
                key_shape: "",
                granularity_tags: &[],
                related_dimensions: &[],
                context_seeds: &[],
                output_schema: json!({}),
            },
        ).build()
    }

    #[test]
    fn exact_catalog_match_reaches_simulated_safe_and_passes_auto_apply() {
        let user = UserId::new();
        let events = vec![Event {
            event_id: kura_core::EventId::new(),
            user_id: user,
            timestamp: Utc::now(),
            event_type: "set.logged".to_string(),
            data: Payload::new(json!({"exercise": "Kniebeuge"})),
            metadata: Payload::empty(),
        }];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });

        let now = Utc::now();
        let proposals = generate_proposals(&issues, now);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].tier, Tier::A);
        assert_eq!(proposals[0].candidate_sources, vec!["catalog_variant_exact"]);

        let known: HashSet<&str> = kura_corrections::EXERCISE_CATALOG.iter().map(|e| e.canonical_key).collect();
        let reg = registry();
        let proposals = simulate_and_finalize(proposals, &reg, &known, now);
        assert_eq!(proposals[0].state, ProposalState::SimulatedSafe);

        let (ok, reason) = auto_apply_decision(&proposals[0], true);
        assert!(ok);
        assert_eq!(reason, AutoApplyReason::PolicyPass);
    }

    #[test]
    fn empty_event_batch_rejects_proposal() {
        let issue = Issue {
            issue_id: "INV-001:unresolved_exercise_identity".to_string(),
            invariant_id: "INV-001",
            issue_type: "unresolved_exercise_identity",
            severity: crate::issue::Severity::High,
            detail: "test".to_string(),
            metrics: json!({"top_unresolved_terms_with_counts": [{"term": "<missing_exercise>", "count": 1}]}),
        };
        let now = Utc::now();
        let mut proposal = propose_inv001(&issue, now);
        let known: HashSet<&str> = HashSet::new();
        let reg = registry();
        let simulation = simulate_event_batch(&proposal.proposed_event_batch, &reg, &known);
        finalize_proposal_state(&mut proposal, simulation, now);
        assert_eq!(proposal.state, ProposalState::Rejected);
    }
}
