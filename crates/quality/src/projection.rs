//! Assembles the `quality_health` projection payload (spec §4.6.1) from the
//! outputs of `issue`, `proposal`, `slo`, `score`, and `autonomy`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::autonomy::AutonomyPolicy;
use crate::issue::Issue;
use crate::proposal::RepairProposal;
use crate::slo::IntegritySlos;

/// Invariants this module can actually detect. Kept explicit (rather than
/// derived from whichever issues happen to be open) so the projection always
/// reports the full evaluated surface, not just the surface that currently
/// has findings.
pub const EVALUATED_INVARIANTS: &[&str] = &["INV-001", "INV-003", "INV-004", "INV-005", "INV-006", "INV-008", "INV-009", "INV-010"];

#[derive(Debug, Clone, Serialize)]
pub struct IssueSummary {
    pub issue_id: String,
    pub invariant_id: &'static str,
    pub issue_type: &'static str,
    pub severity: &'static str,
    pub detail: String,
    pub metrics: Value,
}

impl From<&Issue> for IssueSummary {
    fn from(issue: &Issue) -> Self {
        Self {
            issue_id: issue.issue_id.clone(),
            invariant_id: issue.invariant_id,
            issue_type: issue.issue_type,
            severity: issue.severity.as_str(),
            detail: issue.detail.clone(),
            metrics: issue.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalSummary {
    pub proposal_id: String,
    pub issue_id: String,
    pub issue_type: &'static str,
    pub tier: &'static str,
    pub state: &'static str,
    pub confidence: f64,
    pub confidence_band: &'static str,
    pub source: &'static str,
}

impl From<&RepairProposal> for ProposalSummary {
    fn from(proposal: &RepairProposal) -> Self {
        Self {
            proposal_id: proposal.proposal_id.to_string(),
            issue_id: proposal.issue_id.clone(),
            issue_type: proposal.issue_type,
            tier: proposal.tier.as_str(),
            state: proposal.state.as_str(),
            confidence: crate::proposal::mean_confidence(proposal),
            confidence_band: crate::proposal::confidence_band(proposal),
            source: crate::proposal::dominant_source(proposal),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityHealthProjection {
    pub evaluated_at: DateTime<Utc>,
    pub invariants_evaluated: &'static [&'static str],
    pub quality_score: f64,
    pub status: &'static str,
    pub top_issues: Vec<IssueSummary>,
    pub open_issue_count: usize,
    pub metrics: Value,
    pub proposals: Vec<ProposalSummary>,
    pub integrity_slos: IntegritySlos,
    pub autonomy_policy: AutonomyPolicy,
}

const TOP_ISSUES_LIMIT: usize = 10;

/// Assemble the final `quality_health` projection data from the already
/// independently computed pieces. Pure function — no I/O, no randomness.
pub fn build_quality_projection_data(
    evaluated_at: DateTime<Utc>,
    issues: &[Issue],
    metrics: Value,
    quality_score: f64,
    status: &'static str,
    proposals: &[RepairProposal],
    integrity_slos: IntegritySlos,
    autonomy_policy: AutonomyPolicy,
) -> QualityHealthProjection {
    let top_issues = issues.iter().take(TOP_ISSUES_LIMIT).map(IssueSummary::from).collect();
    let proposal_summaries = proposals.iter().map(ProposalSummary::from).collect();

    QualityHealthProjection {
        evaluated_at,
        invariants_evaluated: EVALUATED_INVARIANTS,
        quality_score,
        status,
        top_issues,
        open_issue_count: issues.len(),
        metrics,
        proposals: proposal_summaries,
        integrity_slos,
        autonomy_policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::autonomy_policy_from_slos;
    use crate::issue::{evaluate_invariants, InvariantInputs};
    use crate::score::{compute_quality_score, status_from_score};
    use crate::slo::compute_integrity_slos;
    use kura_corrections::AliasMap;
    use kura_events::Event;

    #[test]
    fn assembles_projection_with_empty_history() {
        let events: Vec<Event> = Vec::new();
        let alias_map = AliasMap::build(&[]);
        let (issues, metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        let score = compute_quality_score(&issues);
        let status = status_from_score(score, &issues);
        let evaluated_at = Utc::now();
        let unresolved_pct = metrics.get("set_logged_unresolved_pct").and_then(Value::as_f64).unwrap_or(0.0);
        let slos = compute_integrity_slos(&events, unresolved_pct, 0, evaluated_at);
        let autonomy = autonomy_policy_from_slos(&slos, "healthy");

        let projection = build_quality_projection_data(evaluated_at, &issues, metrics, score, status, &[], slos, autonomy);
        assert_eq!(projection.open_issue_count, issues.len());
        assert!(projection.top_issues.len() <= TOP_ISSUES_LIMIT);
    }
}
