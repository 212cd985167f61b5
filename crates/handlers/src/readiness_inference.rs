//! Readiness inference handler (spec §4.4.4).
//!
//! Builds a daily readiness score from sleep/energy/soreness/load signals via
//! the weighted composition formula, then passes the resulting time series to
//! the Normal-Normal readiness engine.

use async_trait::async_trait;
use kura_core::Payload;
use kura_events::ProjectionWrite;
use kura_inference::{run_readiness_inference, ReadinessParams};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::json;
use std::collections::BTreeMap;

use crate::shared::{load_active_typed_events, load_user_context, local_date, record_inference_run};

pub const DIMENSION: &str = "readiness_inference";
const SOURCE_EVENT_TYPES: &[&str] = &["sleep.logged", "energy.logged", "soreness.logged", "set.logged"];

const SLEEP_PRIOR: f64 = 0.6;
const ENERGY_PRIOR: f64 = 0.6;
const SORENESS_PRIOR_PENALTY: f64 = 0.2;
const LOAD_PRIOR_PENALTY: f64 = 0.2;

pub struct ReadinessInferenceHandler {
    pub params: ReadinessParams,
}

impl ReadinessInferenceHandler {
    pub fn new(params: ReadinessParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Handler for ReadinessInferenceHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let events = match load_active_typed_events(ctx, user_id, SOURCE_EVENT_TYPES, &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        if events.is_empty() {
            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, "overview").await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            return HandlerOutcome::Completed;
        }

        let started_at = chrono::Utc::now();
        let series = daily_readiness_series(&events, user_ctx.timezone);
        let last_event_id = events.last().map(|e| e.event_id);
        let result = run_readiness_inference(&series, self.params);
        let data = serde_json::to_value(&result).unwrap_or(json!({}));

        let status = match &result {
            kura_inference::ReadinessResult::Ok(_) => kura_events::InferenceStatus::Success,
            kura_inference::ReadinessResult::InsufficientData { .. } => kura_events::InferenceStatus::Skipped,
        };
        record_inference_run(ctx, user_id, DIMENSION, "overview", "normal_normal_readiness", status, data.clone(), None, started_at).await;

        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> serde_json::Value {
        let Some(rows) = projection_data.get_array("rows") else { return serde_json::Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return json!({}) };
        let today = data.get("readiness_today");
        json!({
            "state": today.and_then(|t| t.get("state")),
            "readiness_mean": today.and_then(|t| t.get("mean")),
        })
    }
}

#[derive(Default)]
struct DaySignals {
    sleep_hours: Vec<f64>,
    energy: Vec<f64>,
    soreness: Vec<f64>,
    set_volume_kg: f64,
}

/// Composition formula (spec §4.4.4):
/// `s = clamp(0.45*sleep + 0.35*energy - 0.20*soreness_penalty - 0.15*load_penalty + 0.25, 0, 1)`.
fn daily_readiness_series(events: &[kura_events::Event], timezone: chrono_tz::Tz) -> Vec<f64> {
    let mut by_day: BTreeMap<chrono::NaiveDate, DaySignals> = BTreeMap::new();
    for event in events {
        let day = local_date(event.timestamp, timezone);
        let signals = by_day.entry(day).or_default();
        match event.event_type.as_str() {
            "sleep.logged" => {
                if let Some(hours) = event.data.get_f64("duration_hours") {
                    signals.sleep_hours.push(hours);
                }
            }
            "energy.logged" => {
                if let Some(level) = event.data.get_f64("level") {
                    signals.energy.push(level);
                }
            }
            "soreness.logged" => {
                if let Some(severity) = event.data.get_f64("severity") {
                    signals.soreness.push(severity);
                }
            }
            "set.logged" => {
                let weight = event.data.get_f64("weight_kg").unwrap_or(0.0);
                let reps = event.data.get_f64("reps").unwrap_or(0.0);
                signals.set_volume_kg += weight * reps;
            }
            _ => {}
        }
    }

    let max_volume = by_day.values().map(|s| s.set_volume_kg).fold(0.0, f64::max).max(1.0);
    by_day
        .values()
        .map(|signals| {
            let sleep_score = avg(&signals.sleep_hours).map(|h| (h / 8.0).clamp(0.0, 1.0)).unwrap_or(SLEEP_PRIOR);
            let energy_score = avg(&signals.energy).map(|e| (e / 10.0).clamp(0.0, 1.0)).unwrap_or(ENERGY_PRIOR);
            let soreness_penalty = avg(&signals.soreness).map(|s| (s / 5.0).clamp(0.0, 1.0)).unwrap_or(SORENESS_PRIOR_PENALTY);
            let load_penalty = if signals.set_volume_kg > 0.0 { (signals.set_volume_kg / max_volume).clamp(0.0, 1.0) } else { LOAD_PRIOR_PENALTY };
            (0.45 * sleep_score + 0.35 * energy_score - 0.20 * soreness_penalty - 0.15 * load_penalty + 0.25).clamp(0.0, 1.0)
        })
        .collect()
}

fn avg(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::UserId;
    use serde_json::json;

    fn event(event_type: &str, data: serde_json::Value) -> kura_events::Event {
        kura_events::Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn score_is_clamped_within_unit_interval() {
        let events = vec![event("sleep.logged", json!({"duration_hours": 9.0})), event("energy.logged", json!({"level": 9.0}))];
        let series = daily_readiness_series(&events, chrono_tz::Tz::UTC);
        assert!(series.iter().all(|s| (0.0..=1.0).contains(s)));
    }
}
