//! Body composition handler (spec §4.4.3).
//!
//! Single `overview` key folding `bodyweight.logged` and `measurement.logged`
//! into weight trend, per-measurement-type history, and all-time stats, plus
//! the latest non-retracted `weight_target.set`. Flags day-over-day weight
//! jumps greater than 5kg within 2 days.

use async_trait::async_trait;
use kura_core::Payload;
use kura_events::{Event, ProjectionWrite};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::shared::{iso_week_key, load_active_typed_events, load_user_context, round_n, DataQuality};

pub const DIMENSION: &str = "body_composition";
const KNOWN_BODYWEIGHT: &[&str] = &["weight_kg", "time_of_day", "conditions"];
const KNOWN_MEASUREMENT: &[&str] = &["type", "value_cm", "side"];
const RECENT_LIMIT: usize = 30;
const HISTORY_LIMIT: usize = 20;
const WEEKLY_WEEKS: usize = 26;
const DAY_JUMP_KG: f64 = 5.0;
const DAY_JUMP_WINDOW_DAYS: i64 = 2;

pub struct BodyCompositionHandler;

#[async_trait]
impl Handler for BodyCompositionHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let events = match load_active_typed_events(ctx, user_id, &["bodyweight.logged", "measurement.logged"], &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let weight_target = match load_active_typed_events(ctx, user_id, &["weight_target.set"], &user_ctx.retracted).await {
            Ok(events) => events.last().map(|e| e.data.as_value().clone()),
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };

        if events.is_empty() && weight_target.is_none() {
            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, "overview").await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            return HandlerOutcome::Completed;
        }

        let last_event_id = events.last().map(|e| e.event_id);
        let data = build_overview(&events, weight_target, user_ctx.timezone);
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> Value {
        let Some(rows) = projection_data.get_array("rows") else { return Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return json!({}) };
        let mut result = Map::new();
        if let Some(w) = data.get("current_weight_kg").filter(|v| !v.is_null()) {
            result.insert("current_weight_kg".to_string(), w.clone());
        }
        if data.get("total_weigh_ins").and_then(Value::as_u64).is_some_and(|n| n > 0) {
            result.insert("total_weigh_ins".to_string(), data["total_weigh_ins"].clone());
        }
        if let Some(types) = data.get("measurement_types").filter(|v| v.as_array().is_some_and(|a| !a.is_empty())) {
            result.insert("measurement_types".to_string(), types.clone());
        }
        if data.get("target").is_some_and(|t| !t.is_null()) {
            result.insert("has_target".to_string(), Value::Bool(true));
        }
        Value::Object(result)
    }
}

fn build_overview(events: &[Event], weight_target: Option<Value>, timezone: chrono_tz::Tz) -> Value {
    let mut dq = DataQuality::new();
    let mut weight_by_week: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut all_weights: Vec<Value> = Vec::new();
    let mut measurements_by_type: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut prev: Option<(f64, chrono::NaiveDate)> = None;

    for event in events {
        let local_date = crate::shared::local_date(event.timestamp, timezone);
        match event.event_type.as_str() {
            "bodyweight.logged" => {
                crate::shared::note_unknown_fields(&mut dq, event, KNOWN_BODYWEIGHT);
                let Some(weight) = event.data.get_f64("weight_kg") else { continue };

                if !(20.0..=300.0).contains(&weight) {
                    dq.add_anomaly("bodyweight_out_of_range", format!("bodyweight {weight}kg outside plausible range"), json!({"event_id": event.event_id, "value": weight}));
                }
                if let Some((prev_weight, prev_date)) = prev {
                    let days_between = (local_date - prev_date).num_days();
                    if days_between <= DAY_JUMP_WINDOW_DAYS && (weight - prev_weight).abs() > DAY_JUMP_KG {
                        dq.add_anomaly(
                            "bodyweight_day_over_day_jump",
                            format!("weight changed {:+.1}kg in {days_between} day(s) ({prev_weight}kg -> {weight}kg)", weight - prev_weight),
                            json!({"event_id": event.event_id, "value": weight, "previous": prev_weight, "days_between": days_between}),
                        );
                    }
                }
                prev = Some((weight, local_date));

                weight_by_week.entry(iso_week_key(local_date)).or_default().push(weight);
                let mut entry = Map::new();
                entry.insert("date".into(), json!(local_date.to_string()));
                entry.insert("weight_kg".into(), json!(weight));
                if let Some(t) = event.data.get_str("time_of_day") {
                    entry.insert("time_of_day".into(), json!(t));
                }
                if let Some(c) = event.data.get_str("conditions") {
                    entry.insert("conditions".into(), json!(c));
                }
                all_weights.push(Value::Object(entry));
            }
            "measurement.logged" => {
                crate::shared::note_unknown_fields(&mut dq, event, KNOWN_MEASUREMENT);
                let mtype = event.data.normalized_str("type");
                let Some(value) = event.data.get_f64("value_cm") else { continue };
                if mtype.is_empty() {
                    continue;
                }
                if !(1.0..=300.0).contains(&value) {
                    dq.add_anomaly("measurement_out_of_range", format!("measurement {mtype} = {value}cm outside plausible range"), json!({"event_id": event.event_id, "value": value}));
                }
                let mut entry = Map::new();
                entry.insert("date".into(), json!(local_date.to_string()));
                entry.insert("value_cm".into(), json!(value));
                if let Some(s) = event.data.get_str("side") {
                    entry.insert("side".into(), json!(s));
                }
                measurements_by_type.entry(mtype).or_default().push(Value::Object(entry));
            }
            _ => {}
        }
    }

    let mut weight_trend = json!({});
    if !all_weights.is_empty() {
        let start = all_weights.len().saturating_sub(RECENT_LIMIT);
        weight_trend["recent_entries"] = json!(all_weights[start..].to_vec());

        let mut weeks: Vec<&String> = weight_by_week.keys().collect();
        weeks.sort();
        if weeks.len() > WEEKLY_WEEKS {
            let drop = weeks.len() - WEEKLY_WEEKS;
            weeks.drain(0..drop);
        }
        weight_trend["weekly_average"] = json!(weeks
            .iter()
            .map(|week| {
                let values = &weight_by_week[*week];
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                json!({"week": week, "avg_weight_kg": round_n(avg, 1), "measurements": values.len()})
            })
            .collect::<Vec<_>>());

        let values: Vec<f64> = all_weights.iter().filter_map(|w| w["weight_kg"].as_f64()).collect();
        weight_trend["all_time"] = json!({
            "min_kg": round_n(values.iter().cloned().fold(f64::INFINITY, f64::min), 1),
            "max_kg": round_n(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max), 1),
            "first_date": all_weights.first().unwrap()["date"],
            "latest_date": all_weights.last().unwrap()["date"],
            "total_entries": all_weights.len(),
        });
    }

    let mut measurements = Map::new();
    for (mtype, mut entries) in measurements_by_type.clone() {
        entries.sort_by(|a, b| a["date"].as_str().cmp(&b["date"].as_str()));
        let values: Vec<f64> = entries.iter().filter_map(|e| e["value_cm"].as_f64()).collect();
        let start = entries.len().saturating_sub(HISTORY_LIMIT);
        measurements.insert(
            mtype,
            json!({
                "current_cm": entries.last().unwrap()["value_cm"],
                "latest_date": entries.last().unwrap()["date"],
                "history": entries[start..].to_vec(),
                "all_time": {
                    "min_cm": round_n(values.iter().cloned().fold(f64::INFINITY, f64::min), 1),
                    "max_cm": round_n(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max), 1),
                    "total_entries": entries.len(),
                },
            }),
        );
    }

    let mut out = json!({
        "current_weight_kg": all_weights.last().and_then(|w| w["weight_kg"].as_f64()),
        "total_weigh_ins": all_weights.len(),
        "weight_trend": weight_trend,
        "measurements": Value::Object(measurements),
        "measurement_types": measurements_by_type.keys().collect::<Vec<_>>(),
        "data_quality": dq.into_value(),
    });
    if let Some(target) = weight_target {
        out["target"] = target;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kura_core::UserId;

    fn event(event_type: &str, data: Value, ts: chrono::DateTime<Utc>) -> Event {
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
    fn day_over_day_jump_over_five_kg_is_flagged() {
        let now = Utc::now();
        let events = vec![
            event("bodyweight.logged", json!({"weight_kg": 80.0}), now),
            event("bodyweight.logged", json!({"weight_kg": 90.0}), now + Duration::days(1)),
        ];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert!(!data["data_quality"]["anomalies"].as_array().unwrap().is_empty());
    }

    #[test]
    fn measurement_without_type_is_skipped() {
        let events = vec![event("measurement.logged", json!({"value_cm": 40.0}), Utc::now())];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert!(data["measurement_types"].as_array().unwrap().is_empty());
    }
}
