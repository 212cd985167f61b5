//! Autonomy policy derived from integrity SLOs (spec §4.6.8).
//!
//! Three tiers gate how much latitude the assistant gets before it must ask
//! the athlete to confirm: `degraded` (SLOs breached) forces confirmation on
//! everything beyond read-only, `monitor` is a cautious middle ground, and
//! `healthy` allows wider autonomous scope. Auto-apply of tier-A repairs is
//! deliberately NOT gated by this policy (see `proposal::auto_apply_decision`)
//! to avoid a bootstrap deadlock where a degraded SLO blocks the very repairs
//! that would fix it.

use serde::Serialize;

use crate::slo::{IntegritySlos, MetricStatus};

pub const AUTONOMY_POLICY_VERSION: &str = "integrity_slo_autonomy_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    ReadOnly,
    Suggest,
    ActWithConfirmation,
    ActAutonomously,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Suggest => "suggest",
            Self::ActWithConfirmation => "act_with_confirmation",
            Self::ActAutonomously => "act_autonomously",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationTemplates {
    pub non_trivial_action: String,
    pub plan_update: String,
    pub repair_action: String,
    pub post_save_followup: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutonomyPolicy {
    pub policy_version: &'static str,
    pub status: MetricStatus,
    pub max_scope_level: ScopeLevel,
    pub requires_confirmation: bool,
    pub repair_auto_apply_enabled: bool,
    pub confirmation_templates: ConfirmationTemplates,
}

/// Derive the agent-facing autonomy policy from the current integrity SLOs
/// and the calibration status (extraction/catalog calibration health, carried
/// alongside SLOs but not itself an SLO component). Worse of the two wins.
pub fn autonomy_policy_from_slos(integrity_slos: &IntegritySlos, calibration_status: &str) -> AutonomyPolicy {
    let calibration_degraded = calibration_status == "degraded";
    let calibration_monitor = calibration_status == "monitor";

    let status = if integrity_slos.status == MetricStatus::Degraded || calibration_degraded {
        MetricStatus::Degraded
    } else if integrity_slos.status == MetricStatus::Monitor || calibration_monitor {
        MetricStatus::Monitor
    } else {
        MetricStatus::Healthy
    };

    match status {
        MetricStatus::Degraded => AutonomyPolicy {
            policy_version: AUTONOMY_POLICY_VERSION,
            status,
            max_scope_level: ScopeLevel::ReadOnly,
            requires_confirmation: true,
            repair_auto_apply_enabled: false,
            confirmation_templates: ConfirmationTemplates {
                non_trivial_action: "Data quality is degraded right now, so I'll hold off and just explain what I see rather than changing anything. Want me to walk through the options instead?".to_string(),
                plan_update: "I can see the plan, but I won't adjust it while data quality is degraded. Here's what I'd suggest once that's resolved.".to_string(),
                repair_action: "I found a data issue but automatic repair is paused while quality is degraded. A maintainer should review this before anything is changed.".to_string(),
                post_save_followup: "That was saved, but I'm not going to draw conclusions from it until the underlying data quality issue clears up.".to_string(),
            },
        },
        MetricStatus::Monitor => AutonomyPolicy {
            policy_version: AUTONOMY_POLICY_VERSION,
            status,
            max_scope_level: ScopeLevel::ActWithConfirmation,
            requires_confirmation: true,
            repair_auto_apply_enabled: true,
            confirmation_templates: ConfirmationTemplates {
                non_trivial_action: "Before I do that, can you confirm it's correct? I've been seeing a few data quality hiccups, so I want to double-check before going further.".to_string(),
                plan_update: "I'd like to update your plan this way — does that look right to you before I apply it?".to_string(),
                repair_action: "I found a likely data issue and have a fix ready. Should I go ahead and apply it?".to_string(),
                post_save_followup: "That's saved. I'll flag anything that looks off so we can confirm together.".to_string(),
            },
        },
        MetricStatus::Healthy => AutonomyPolicy {
            policy_version: AUTONOMY_POLICY_VERSION,
            status,
            max_scope_level: ScopeLevel::ActAutonomously,
            requires_confirmation: false,
            repair_auto_apply_enabled: true,
            confirmation_templates: ConfirmationTemplates {
                non_trivial_action: "I'll go ahead and take care of that for you.".to_string(),
                plan_update: "I've updated your plan accordingly.".to_string(),
                repair_action: "I found and fixed a small data issue automatically.".to_string(),
                post_save_followup: "That's saved — here's what it tells us.".to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slo::SloMetric;

    fn metric(status: MetricStatus) -> SloMetric {
        SloMetric { metric: "x", value: 0.0, unit: "percent", status, window_days: 7, sample_count: 0 }
    }

    fn slos(status: MetricStatus) -> IntegritySlos {
        IntegritySlos {
            status,
            window_days: 7,
            unresolved_set_logged_pct: metric(status),
            save_claim_mismatch_rate_pct: metric(MetricStatus::Healthy),
            repair_latency_hours_p50: metric(MetricStatus::Healthy),
            regressions: Vec::new(),
        }
    }

    #[test]
    fn degraded_slo_forces_read_only_scope_and_disables_auto_apply() {
        let policy = autonomy_policy_from_slos(&slos(MetricStatus::Degraded), "healthy");
        assert_eq!(policy.max_scope_level, ScopeLevel::ReadOnly);
        assert!(!policy.repair_auto_apply_enabled);
        assert!(policy.requires_confirmation);
    }

    #[test]
    fn healthy_slo_and_calibration_allows_autonomous_scope() {
        let policy = autonomy_policy_from_slos(&slos(MetricStatus::Healthy), "healthy");
        assert_eq!(policy.max_scope_level, ScopeLevel::ActAutonomously);
        assert!(!policy.requires_confirmation);
    }

    #[test]
    fn degraded_calibration_overrides_healthy_slos() {
        let policy = autonomy_policy_from_slos(&slos(MetricStatus::Healthy), "degraded");
        assert_eq!(policy.status, MetricStatus::Degraded);
        assert_eq!(policy.max_scope_level, ScopeLevel::ReadOnly);
    }

    #[test]
    fn monitor_slo_keeps_auto_apply_enabled_but_requires_confirmation() {
        let policy = autonomy_policy_from_slos(&slos(MetricStatus::Monitor), "healthy");
        assert_eq!(policy.max_scope_level, ScopeLevel::ActWithConfirmation);
        assert!(policy.repair_auto_apply_enabled);
        assert!(policy.requires_confirmation);
    }
}
