//! Exercise progression handler (spec §4.4.1).
//!
//! Keyed per canonical exercise. Folds `set.logged`/`set.corrected` into
//! best e1RM, totals, per-session aggregates, weekly rollups, and recent
//! sessions; consolidates stale keys on `exercise.alias_created`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kura_corrections::{apply_set_correction_chain, CorrectedSet};
use kura_core::Payload;
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use kura_events::ProjectionWrite;
use serde_json::{json, Value};
use tracing::warn;

use crate::shared::{self, epley_1rm, iso_week_key, load_active_typed_events, load_user_context, round_n, session_key_for, DataQuality};

pub const DIMENSION: &str = "exercise_progression";
const KNOWN_SET_FIELDS: &[&str] = &["exercise", "exercise_id", "weight_kg", "reps", "rpe", "session_id", "retracted"];
const RECENT_SESSIONS_LIMIT: usize = 5;
const WEEKLY_ROLLUP_WEEKS: usize = 26;

pub struct ExerciseProgressionHandler;

#[async_trait]
impl Handler for ExerciseProgressionHandler {
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
            let data = build_projection(rows, user_ctx.timezone);
            let last_event_id = rows.iter().max_by_key(|r| r.event.timestamp).map(|r| r.event.event_id);
            let write = ProjectionWrite::new(user_id, DIMENSION, exercise_id.clone(), Payload::new(data), last_event_id);
            if let Err(e) = ctx.projections.upsert(write).await {
                return HandlerOutcome::Retryable(e.to_string());
            }
        }

        // Alias consolidation: delete stale-keyed rows no longer backed by
        // any surviving set.logged event under that key (spec §4.4.1).
        if invocation.event_type == "exercise.alias_created" {
            match ctx.projections.list_by_type(user_id, DIMENSION).await {
                Ok(existing) => {
                    for row in existing {
                        if !by_exercise.contains_key(&row.key) {
                            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, &row.key).await {
                                warn!(error = %e, key = %row.key, "failed to delete orphaned exercise_progression row");
                                return HandlerOutcome::Retryable(e.to_string());
                            }
                        }
                    }
                }
                Err(e) => return HandlerOutcome::Retryable(e.to_string()),
            }
        }

        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> Value {
        let exercises: Vec<Value> = projection_data
            .get_array("rows")
            .map(|rows| rows.iter().filter_map(|r| r.get("key").cloned()).collect())
            .unwrap_or_default();
        json!({"exercises": exercises})
    }
}

fn resolve_exercise_key(row: &CorrectedSet, alias_map: &kura_corrections::AliasMap) -> String {
    let explicit = row.effective_data.get("exercise_id").and_then(Value::as_str).map(|s| s.trim().to_lowercase());
    if let Some(id) = explicit {
        if !id.is_empty() {
            return id;
        }
    }
    let exercise = row.effective_data.get("exercise").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
    if exercise.is_empty() {
        return String::new();
    }
    alias_map.resolve(&exercise).unwrap_or_else(|| kura_corrections::resolve_exercise_term(&exercise).canonical_key().to_string())
}

fn set_weight_reps(row: &CorrectedSet) -> Option<(f64, f64)> {
    let weight = row.effective_data.get("weight_kg").and_then(weight_value_as_f64)?;
    let reps = row.effective_data.get("reps").and_then(weight_value_as_f64)?;
    Some((weight, reps))
}

fn weight_value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_projection(rows: &[&CorrectedSet], timezone: chrono_tz::Tz) -> Value {
    let mut dq = DataQuality::new();
    let mut best: Option<(f64, DateTime<Utc>)> = None;
    let mut total_sets = 0usize;
    let mut total_volume_kg = 0.0;
    let mut by_session: BTreeMap<String, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    let mut by_week: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for row in rows {
        let Some((weight, reps)) = set_weight_reps(row) else {
            dq.add_anomaly("set_missing_weight_or_reps", "set.logged is missing weight_kg or reps", json!({"timestamp": row.event.timestamp}));
            continue;
        };
        if weight <= 0.0 || reps <= 0.0 {
            dq.add_anomaly("set_non_positive_value", "weight_kg/reps must be positive", json!({"weight_kg": weight, "reps": reps}));
            continue;
        }
        total_sets += 1;
        total_volume_kg += weight * reps;

        let e1rm = epley_1rm(weight, reps);
        if best.map(|(b, _)| e1rm > b).unwrap_or(true) {
            best = Some((e1rm, row.event.timestamp));
        }

        let session_id = row.effective_data.get("session_id").and_then(Value::as_str);
        let session_key = session_key_for(session_id, row.event.timestamp, timezone);
        by_session.entry(session_key).or_default().push((row.event.timestamp, e1rm));

        let local_date = shared::local_date(row.event.timestamp, timezone);
        by_week.entry(iso_week_key(local_date)).or_default().push(e1rm);
    }

    let mut sessions: Vec<(String, DateTime<Utc>, f64)> = by_session
        .into_iter()
        .map(|(key, entries)| {
            let latest = entries.iter().map(|(ts, _)| *ts).max().unwrap_or_default();
            let best_in_session = entries.iter().map(|(_, e)| *e).fold(0.0, f64::max);
            (key, latest, best_in_session)
        })
        .collect();
    sessions.sort_by(|a, b| b.1.cmp(&a.1));
    let recent_sessions: Vec<Value> = sessions
        .into_iter()
        .take(RECENT_SESSIONS_LIMIT)
        .map(|(key, latest, best_e1rm)| json!({"session_key": key, "latest_set_at": latest, "best_estimated_1rm": round_n(best_e1rm, 2)}))
        .collect();

    let mut weekly_rollups: Vec<Value> = by_week
        .into_iter()
        .map(|(week, values)| {
            let best_in_week = values.iter().cloned().fold(0.0, f64::max);
            json!({"iso_week": week, "best_estimated_1rm": round_n(best_in_week, 2), "set_count": values.len()})
        })
        .collect();
    weekly_rollups.sort_by(|a, b| a["iso_week"].as_str().cmp(&b["iso_week"].as_str()));
    if weekly_rollups.len() > WEEKLY_ROLLUP_WEEKS {
        let drop = weekly_rollups.len() - WEEKLY_ROLLUP_WEEKS;
        weekly_rollups.drain(0..drop);
    }

    json!({
        "best_estimated_1rm": best.map(|(v, _)| round_n(v, 2)),
        "best_estimated_1rm_at": best.map(|(_, ts)| ts),
        "total_sets": total_sets,
        "total_volume_kg": round_n(total_volume_kg, 2),
        "weekly_rollups": weekly_rollups,
        "recent_sessions": recent_sessions,
        "data_quality": dq.into_value(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::UserId;
    use kura_events::Event;

    fn set_event(exercise_id: &str, weight: f64, reps: f64, ts: DateTime<Utc>) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: ts,
            event_type: "set.logged".to_string(),
            data: Payload::new(json!({"exercise_id": exercise_id, "weight_kg": weight, "reps": reps})),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn best_1rm_picks_the_highest_epley_estimate() {
        let events = vec![
            set_event("barbell_back_squat", 100.0, 5.0, Utc::now()),
            set_event("barbell_back_squat", 120.0, 3.0, Utc::now()),
        ];
        let corrected = apply_set_correction_chain(events, &[]);
        let refs: Vec<&CorrectedSet> = corrected.iter().collect();
        let data = build_projection(&refs, chrono_tz::Tz::UTC);
        let expected = round_n(epley_1rm(120.0, 3.0).max(epley_1rm(100.0, 5.0)), 2);
        assert_eq!(data["best_estimated_1rm"], json!(expected));
    }

    #[test]
    fn non_positive_weight_is_flagged_and_excluded() {
        let events = vec![set_event("barbell_back_squat", -5.0, 5.0, Utc::now())];
        let corrected = apply_set_correction_chain(events, &[]);
        let refs: Vec<&CorrectedSet> = corrected.iter().collect();
        let data = build_projection(&refs, chrono_tz::Tz::UTC);
        assert_eq!(data["total_sets"], json!(0));
        assert!(!data["data_quality"]["anomalies"].as_array().unwrap().is_empty());
    }
}
