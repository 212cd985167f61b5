//! Quality and repair state machine (spec §4.6).
//!
//! This crate evaluates read-only invariants over a user's event history,
//! proposes and simulates repairs for the invariants that have a generator,
//! decides whether a repair may auto-apply, computes integrity SLOs over a
//! rolling window, and derives the agent's autonomy policy from those SLOs.
//! It is pure: every public function takes data in and returns data out. The
//! caller (the `quality_health` projection handler) owns persistence and the
//! read-after-write verification loop that closes `applied -> verified_closed`.

mod autonomy;
mod issue;
mod mention_fields;
mod projection;
mod proposal;
mod score;
mod slo;

pub use autonomy::{autonomy_policy_from_slos, AutonomyPolicy, ConfirmationTemplates, ScopeLevel, AUTONOMY_POLICY_VERSION};
pub use issue::{evaluate_invariants, sort_issues, InvariantInputs, Issue, Severity};
pub use mention_fields::{evaluate_set_context_rows, extract_set_context_mentions, MentionRow, Modality, SetContextEvaluation};
pub use projection::{build_quality_projection_data, IssueSummary, ProposalSummary, QualityHealthProjection, EVALUATED_INVARIANTS};
pub use proposal::{
    auto_apply_decision, build_fix_applied_event, build_fix_rejected_event, build_issue_closed_event, finalize_proposal_state,
    generate_proposals, simulate_and_finalize, simulate_event_batch, AutoApplyReason, ImpactChange, ProjectionImpact, ProposalState,
    ProposedEvent, RepairProposal, SimWarning, SimulationResult, StateHistoryEntry, Tier, AUTO_APPLY_POLICY_GATE,
    AUTO_APPLY_POLICY_VERSION, DETERMINISTIC_PROPOSAL_SOURCES, SIMULATE_ENDPOINT,
};
pub use score::{compute_quality_score, status_from_score};
pub use slo::{compute_integrity_slos, compute_repair_latency_slo, compute_save_claim_slo, worst_status, IntegritySlos, MetricStatus, SloMetric, SLO_LOOKBACK_DAYS};
