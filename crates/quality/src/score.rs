//! Rolls the evaluated issues into a single quality score and status
//! (spec §4.6.1). The score is a coarse summary used for trend/dashboard
//! purposes; the issue list itself is the actionable signal.

use crate::issue::{Issue, Severity};

const MAX_PENALTY: f64 = 0.95;

/// `1 - min(sum(severity_weight), 0.95)`, rounded to 3 decimals.
pub fn compute_quality_score(issues: &[Issue]) -> f64 {
    let penalty: f64 = issues.iter().map(|issue| issue.severity.score_weight()).sum::<f64>().min(MAX_PENALTY);
    let score = 1.0 - penalty;
    (score * 1000.0).round() / 1000.0
}

/// Any high-severity issue forces `degraded` regardless of score; otherwise
/// the score bands it into `healthy` (>=0.9), `monitor` (>=0.75), or
/// `degraded`.
pub fn status_from_score(score: f64, issues: &[Issue]) -> &'static str {
    if issues.iter().any(|issue| issue.severity == Severity::High) {
        return "degraded";
    }
    if score >= 0.9 {
        "healthy"
    } else if score >= 0.75 {
        "monitor"
    } else {
        "degraded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_corrections::AliasMap;
    use kura_events::Event;

    #[test]
    fn no_issues_scores_perfect_and_healthy() {
        let score = compute_quality_score(&[]);
        assert_eq!(score, 1.0);
        assert_eq!(status_from_score(score, &[]), "healthy");
    }

    #[test]
    fn real_world_gap_set_scores_degraded_via_high_severity_override() {
        let events: Vec<Event> = Vec::new();
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = crate::issue::evaluate_invariants(&crate::issue::InvariantInputs { events: &events, alias_map: &alias_map });
        // No set.logged events at all still trips INV-003 (missing timezone), a high.
        let score = compute_quality_score(&issues);
        assert_eq!(status_from_score(score, &issues), "degraded");
    }

    #[test]
    fn score_floor_is_bounded_by_max_penalty() {
        use crate::issue::Severity;
        let issue = |severity: Severity| crate::issue::Issue {
            issue_id: "x".into(),
            invariant_id: "INV-000",
            issue_type: "synthetic",
            severity,
            detail: String::new(),
            metrics: serde_json::json!({}),
        };
        let many = vec![issue(Severity::High); 10];
        let score = compute_quality_score(&many);
        assert!(score >= 1.0 - MAX_PENALTY - 1e-9);
    }
}
