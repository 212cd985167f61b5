//! Integrity SLOs computed over a rolling 7-day window (spec §4.6.7).

use chrono::{DateTime, Duration, Utc};
use kura_events::Event;
use serde::Serialize;
use serde_json::Value;

pub const SLO_LOOKBACK_DAYS: i64 = 7;

const UNRESOLVED_SET_PCT_HEALTHY_MAX: f64 = 2.0;
const UNRESOLVED_SET_PCT_MONITOR_MAX: f64 = 5.0;
const SAVE_CLAIM_MISMATCH_PCT_HEALTHY_MAX: f64 = 0.0;
const SAVE_CLAIM_MISMATCH_PCT_MONITOR_MAX: f64 = 1.0;
const REPAIR_LATENCY_HOURS_HEALTHY_MAX: f64 = 24.0;
const REPAIR_LATENCY_HOURS_MONITOR_MAX: f64 = 48.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Healthy,
    Monitor,
    Degraded,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Monitor => "monitor",
            Self::Degraded => "degraded",
        }
    }
}

fn metric_status(value: f64, healthy_max: f64, monitor_max: f64) -> MetricStatus {
    if value <= healthy_max {
        MetricStatus::Healthy
    } else if value <= monitor_max {
        MetricStatus::Monitor
    } else {
        MetricStatus::Degraded
    }
}

/// Worst-of over any number of statuses (spec §4.6.7 "Overall... = worst of
/// the three"); `degraded > monitor > healthy`.
pub fn worst_status(statuses: &[MetricStatus]) -> MetricStatus {
    statuses.iter().copied().max().unwrap_or(MetricStatus::Healthy)
}

#[derive(Debug, Clone, Serialize)]
pub struct SloMetric {
    pub metric: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub status: MetricStatus,
    pub window_days: i64,
    pub sample_count: usize,
}

/// Extract mismatch severity/weight from a `quality.save_claim.checked`
/// event. Legacy events without explicit severity/weight fall back to
/// binary classification (spec §4.6.7 severity-weighted save-claim SLO).
fn severity_weight_from_event(data: &kura_core::Payload) -> (String, f64) {
    if let (Some(severity), Some(weight)) = (data.get_str("mismatch_severity"), data.get_f64("mismatch_weight")) {
        return (severity.to_string(), weight.clamp(0.0, 1.0));
    }
    let mismatch_detected = data.get_bool("mismatch_detected").unwrap_or_else(|| !data.get_bool("allow_saved_claim").unwrap_or(false));
    if mismatch_detected {
        ("critical".to_string(), 1.0)
    } else {
        ("none".to_string(), 0.0)
    }
}

pub fn compute_save_claim_slo(events: &[Event], window_start: DateTime<Utc>) -> SloMetric {
    let sampled: Vec<&Event> = events.iter().filter(|e| e.event_type == "quality.save_claim.checked" && e.timestamp >= window_start).collect();
    let total_checks = sampled.len();
    let mut weighted_sum = 0.0;
    for row in &sampled {
        let (_, weight) = severity_weight_from_event(&row.data);
        weighted_sum += weight;
    }
    let weighted_pct = if total_checks > 0 { round2((weighted_sum / total_checks as f64) * 100.0) } else { 0.0 };

    SloMetric {
        metric: "save_claim_mismatch_rate_pct",
        value: weighted_pct,
        unit: "percent",
        status: metric_status(weighted_pct, SAVE_CLAIM_MISMATCH_PCT_HEALTHY_MAX, SAVE_CLAIM_MISMATCH_PCT_MONITOR_MAX),
        window_days: SLO_LOOKBACK_DAYS,
        sample_count: total_checks,
    }
}

/// Median repair latency (hours) from `quality.fix.applied` to the matching
/// `quality.issue.closed`, joined by `proposal_id` (spec §4.6.7).
pub fn compute_repair_latency_slo(events: &[Event], window_start: DateTime<Utc>) -> SloMetric {
    let mut applied_by_proposal: std::collections::HashMap<String, DateTime<Utc>> = std::collections::HashMap::new();
    let mut latencies: Vec<f64> = Vec::new();

    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by_key(|e| e.timestamp);

    for row in ordered {
        let proposal_id = row.data.normalized_str("proposal_id");
        if proposal_id.is_empty() {
            continue;
        }
        if row.event_type == "quality.fix.applied" {
            applied_by_proposal.insert(proposal_id, row.timestamp);
            continue;
        }
        if row.event_type == "quality.issue.closed" && row.timestamp >= window_start {
            if let Some(&applied_at) = applied_by_proposal.get(&proposal_id) {
                if row.timestamp >= applied_at {
                    latencies.push((row.timestamp - applied_at).num_seconds() as f64 / 3600.0);
                }
            }
        }
    }

    let p50 = median(&mut latencies);
    SloMetric {
        metric: "repair_latency_hours_p50",
        value: round3(p50),
        unit: "hours",
        status: metric_status(p50, REPAIR_LATENCY_HOURS_HEALTHY_MAX, REPAIR_LATENCY_HOURS_MONITOR_MAX),
        window_days: SLO_LOOKBACK_DAYS,
        sample_count: latencies.len(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegritySlos {
    pub status: MetricStatus,
    pub window_days: i64,
    pub unresolved_set_logged_pct: SloMetric,
    pub save_claim_mismatch_rate_pct: SloMetric,
    pub repair_latency_hours_p50: SloMetric,
    pub regressions: Vec<&'static str>,
}

/// Roll the three component SLOs (spec §4.6.7 table) up into an overall
/// integrity status — worst of the three.
pub fn compute_integrity_slos(events: &[Event], unresolved_pct: f64, unresolved_sample_count: usize, evaluated_at: DateTime<Utc>) -> IntegritySlos {
    let window_start = evaluated_at - Duration::days(SLO_LOOKBACK_DAYS);

    let unresolved_metric = SloMetric {
        metric: "unresolved_set_logged_pct",
        value: round2(unresolved_pct),
        unit: "percent",
        status: metric_status(unresolved_pct, UNRESOLVED_SET_PCT_HEALTHY_MAX, UNRESOLVED_SET_PCT_MONITOR_MAX),
        window_days: SLO_LOOKBACK_DAYS,
        sample_count: unresolved_sample_count,
    };
    let save_claim_metric = compute_save_claim_slo(events, window_start);
    let repair_latency_metric = compute_repair_latency_slo(events, window_start);

    let overall = worst_status(&[unresolved_metric.status, save_claim_metric.status, repair_latency_metric.status]);
    let mut regressions = Vec::new();
    if unresolved_metric.status != MetricStatus::Healthy {
        regressions.push(unresolved_metric.metric);
    }
    if save_claim_metric.status != MetricStatus::Healthy {
        regressions.push(save_claim_metric.metric);
    }
    if repair_latency_metric.status != MetricStatus::Healthy {
        regressions.push(repair_latency_metric.metric);
    }

    IntegritySlos {
        status: overall,
        window_days: SLO_LOOKBACK_DAYS,
        unresolved_set_logged_pct: unresolved_metric,
        save_claim_mismatch_rate_pct: save_claim_metric,
        repair_latency_hours_p50: repair_latency_metric,
        regressions,
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::{Payload, UserId};
    use serde_json::json;

    fn event(event_type: &str, ts: DateTime<Utc>, data: Value) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: ts,
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn unresolved_pct_above_five_is_degraded() {
        let status = metric_status(6.0, UNRESOLVED_SET_PCT_HEALTHY_MAX, UNRESOLVED_SET_PCT_MONITOR_MAX);
        assert_eq!(status, MetricStatus::Degraded);
    }

    #[test]
    fn repair_latency_joins_applied_to_closed_by_proposal_id() {
        let now = Utc::now();
        let window_start = now - Duration::days(SLO_LOOKBACK_DAYS);
        let events = vec![
            event("quality.fix.applied", window_start + Duration::hours(1), json!({"proposal_id": "repair:INV-001:x"})),
            event("quality.issue.closed", window_start + Duration::hours(5), json!({"proposal_id": "repair:INV-001:x"})),
        ];
        let metric = compute_repair_latency_slo(&events, window_start);
        assert_eq!(metric.sample_count, 1);
        assert_eq!(metric.value, 4.0);
        assert_eq!(metric.status, MetricStatus::Healthy);
    }

    #[test]
    fn worst_status_picks_degraded_over_healthy() {
        assert_eq!(worst_status(&[MetricStatus::Healthy, MetricStatus::Degraded, MetricStatus::Monitor]), MetricStatus::Degraded);
    }
}
