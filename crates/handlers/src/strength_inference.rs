//! Strength inference handler (spec §4.4.5).
//!
//! Per canonical exercise: filters `set.logged` across the exercise and its
//! aliases, takes the best estimated 1RM per session/day, and passes the
//! resulting `(day_offset, e1RM)` series to the closed-form strength engine.

use async_trait::async_trait;
use chrono_tz::Tz;
use kura_core::Payload;
use kura_corrections::{apply_set_correction_chain, CorrectedSet};
use kura_events::ProjectionWrite;
use kura_inference::{run_strength_inference, StrengthParams};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

use crate::shared::{epley_1rm, load_active_typed_events, load_user_context, record_inference_run};

pub const DIMENSION: &str = "strength_inference";

pub struct StrengthInferenceHandler {
    pub params: StrengthParams,
}

impl StrengthInferenceHandler {
    pub fn new(params: StrengthParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Handler for StrengthInferenceHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let raw_sets = match load_active_typed_events(ctx, user_id, &["set.logged"], &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let corrections = match load_active_typed_events(ctx, user_id, &["set.corrected"], &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let corrected = apply_set_correction_chain(raw_sets, &corrections);

        let mut by_exercise: HashMap<String, Vec<&CorrectedSet>> = HashMap::new();
        for row in &corrected {
            let exercise_id = resolve_exercise_key(row, &user_ctx.alias_map);
            if exercise_id.is_empty() {
                continue;
            }
            by_exercise.entry(exercise_id).or_default().push(row);
        }

        for (exercise_id, rows) in &by_exercise {
            let started_at = chrono::Utc::now();
            let series = daily_best_series(rows, user_ctx.timezone);
            let result = run_strength_inference(&series, self.params);
            let last_event_id = rows.iter().max_by_key(|r| r.event.timestamp).map(|r| r.event.event_id);
            let data = serde_json::to_value(&result).unwrap_or(json!({}));

            let status = match &result {
                kura_inference::StrengthResult::Ok(_) => kura_events::InferenceStatus::Success,
                kura_inference::StrengthResult::InsufficientData { .. } => kura_events::InferenceStatus::Skipped,
            };
            record_inference_run(ctx, user_id, DIMENSION, exercise_id, "closed_form_strength", status, data.clone(), None, started_at).await;

            let write = ProjectionWrite::new(user_id, DIMENSION, exercise_id.clone(), Payload::new(data), last_event_id);
            if let Err(e) = ctx.projections.upsert(write).await {
                return HandlerOutcome::Retryable(e.to_string());
            }
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> serde_json::Value {
        let exercises: Vec<serde_json::Value> = projection_data
            .get_array("rows")
            .map(|rows| rows.iter().filter_map(|r| r.get("key").cloned()).collect())
            .unwrap_or_default();
        json!({"exercises": exercises})
    }
}

fn resolve_exercise_key(row: &CorrectedSet, alias_map: &kura_corrections::AliasMap) -> String {
    let explicit = row.effective_data.get("exercise_id").and_then(serde_json::Value::as_str).map(|s| s.trim().to_lowercase());
    if let Some(id) = explicit {
        if !id.is_empty() {
            return id;
        }
    }
    let exercise = row.effective_data.get("exercise").and_then(serde_json::Value::as_str).unwrap_or("").trim().to_lowercase();
    if exercise.is_empty() {
        return String::new();
    }
    alias_map.resolve(&exercise).unwrap_or_else(|| kura_corrections::resolve_exercise_term(&exercise).canonical_key().to_string())
}

/// Lazily materializes the best estimated 1RM per day, as `(day_offset,
/// e1RM)` pairs relative to the first training day for this exercise.
fn daily_best_series(rows: &[&CorrectedSet], timezone: Tz) -> Vec<(f64, f64)> {
    let mut by_day: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
    for row in rows {
        let weight = row.effective_data.get("weight_kg").and_then(serde_json::Value::as_f64);
        let reps = row.effective_data.get("reps").and_then(serde_json::Value::as_f64);
        let (Some(weight), Some(reps)) = (weight, reps) else { continue };
        if weight <= 0.0 || reps <= 0.0 {
            continue;
        }
        let day = crate::shared::local_date(row.event.timestamp, timezone);
        let e1rm = epley_1rm(weight, reps);
        let entry = by_day.entry(day).or_insert(0.0);
        if e1rm > *entry {
            *entry = e1rm;
        }
    }
    let Some(first_day) = by_day.keys().next().copied() else {
        return Vec::new();
    };
    by_day.into_iter().map(|(day, best)| ((day - first_day).num_days() as f64, best)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use kura_core::{EventId, UserId};

    fn set_event(exercise_id: &str, weight: f64, reps: f64, ts: DateTime<Utc>) -> kura_events::Event {
        kura_events::Event {
            event_id: EventId::new(),
            user_id: UserId::new(),
            timestamp: ts,
            event_type: "set.logged".to_string(),
            data: Payload::new(json!({"exercise_id": exercise_id, "weight_kg": weight, "reps": reps})),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn series_is_day_offsets_from_first_training_day() {
        let now = Utc::now();
        let events = vec![set_event("squat", 100.0, 5.0, now), set_event("squat", 105.0, 5.0, now + Duration::days(7))];
        let corrected = apply_set_correction_chain(events, &[]);
        let refs: Vec<&CorrectedSet> = corrected.iter().collect();
        let series = daily_best_series(&refs, Tz::UTC);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].0, 0.0);
        assert_eq!(series[1].0, 7.0);
    }
}
