//! Recovery handler (spec §4.4.3).
//!
//! Single `overview` key folding `sleep.logged`, `soreness.logged`, and
//! `energy.logged` into weekly-averaged recovery signals, plus the latest
//! non-retracted `sleep_target.set` as a target.

use async_trait::async_trait;
use kura_core::Payload;
use kura_events::{Event, ProjectionWrite};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::shared::{iso_week_key, load_active_typed_events, load_user_context, round_n, DataQuality};

pub const DIMENSION: &str = "recovery";
const KNOWN_SLEEP: &[&str] = &["duration_hours", "quality", "bed_time", "bedtime", "wake_time"];
const KNOWN_SORENESS: &[&str] = &["area", "severity", "notes"];
const KNOWN_ENERGY: &[&str] = &["level", "time_of_day"];
const RECENT_LIMIT: usize = 30;
const WEEKLY_WEEKS: usize = 26;

pub struct RecoveryHandler;

#[async_trait]
impl Handler for RecoveryHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let user_ctx = match load_user_context(ctx, user_id).await {
            Ok(c) => c,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let events = match load_active_typed_events(ctx, user_id, &["sleep.logged", "soreness.logged", "energy.logged"], &user_ctx.retracted).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        let sleep_target = match load_active_typed_events(ctx, user_id, &["sleep_target.set"], &user_ctx.retracted).await {
            Ok(events) => events.last().map(|e| e.data.as_value().clone()),
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };

        if events.is_empty() && sleep_target.is_none() {
            if let Err(e) = ctx.projections.delete(user_id, DIMENSION, "overview").await {
                return HandlerOutcome::Retryable(e.to_string());
            }
            return HandlerOutcome::Completed;
        }

        let last_event_id = events.last().map(|e| e.event_id);
        let data = build_overview(&events, sleep_target, user_ctx.timezone);
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
        if let Some(overall) = data.get("sleep").and_then(|s| s.get("overall")).filter(|v| !v.is_null()) {
            result.insert("avg_sleep_hours".to_string(), overall["avg_duration_hours"].clone());
            result.insert("total_sleep_entries".to_string(), overall["total_entries"].clone());
        }
        if data.get("soreness").and_then(|s| s.get("total_entries")).and_then(Value::as_u64).is_some_and(|n| n > 0) {
            result.insert("total_soreness_entries".to_string(), data["soreness"]["total_entries"].clone());
        }
        if let Some(overall) = data.get("energy").and_then(|e| e.get("overall")).filter(|v| !v.is_null()) {
            result.insert("avg_energy_level".to_string(), overall["avg_level"].clone());
        }
        if data.get("targets").is_some_and(|t| !t.is_null()) {
            result.insert("has_targets".to_string(), Value::Bool(true));
        }
        Value::Object(result)
    }
}

fn build_overview(events: &[Event], sleep_target: Option<Value>, timezone: chrono_tz::Tz) -> Value {
    let mut dq = DataQuality::new();
    let mut sleep_entries: Vec<Value> = Vec::new();
    let mut sleep_by_week: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut soreness_entries: Vec<Value> = Vec::new();
    let mut energy_entries: Vec<Value> = Vec::new();
    let mut energy_by_week: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for event in events {
        let local_date = crate::shared::local_date(event.timestamp, timezone);
        match event.event_type.as_str() {
            "sleep.logged" => {
                crate::shared::note_unknown_fields(&mut dq, event, KNOWN_SLEEP);
                let Some(duration) = event.data.get_f64("duration_hours") else {
                    continue;
                };
                if !(0.0..=20.0).contains(&duration) {
                    dq.add_anomaly("sleep_duration_out_of_range", format!("sleep duration {duration}h outside plausible range"), json!({"event_id": event.event_id, "value": duration}));
                }
                let mut entry = Map::new();
                entry.insert("date".into(), json!(local_date.to_string()));
                entry.insert("duration_hours".into(), json!(duration));
                if let Some(q) = event.data.get_str("quality") {
                    entry.insert("quality".into(), json!(q));
                }
                let bed_time = event.data.get_str("bed_time").or_else(|| event.data.get_str("bedtime"));
                if let Some(b) = bed_time {
                    entry.insert("bed_time".into(), json!(b));
                }
                if let Some(w) = event.data.get_str("wake_time") {
                    entry.insert("wake_time".into(), json!(w));
                }
                sleep_entries.push(Value::Object(entry));
                sleep_by_week.entry(iso_week_key(local_date)).or_default().push(duration);
            }
            "soreness.logged" => {
                crate::shared::note_unknown_fields(&mut dq, event, KNOWN_SORENESS);
                let area = event.data.normalized_str("area");
                let Some(severity) = event.data.get_f64("severity") else {
                    continue;
                };
                if area.is_empty() {
                    continue;
                }
                if !(1.0..=5.0).contains(&severity) {
                    dq.add_anomaly("soreness_severity_out_of_range", format!("soreness severity {severity} outside 1-5 scale"), json!({"event_id": event.event_id, "value": severity}));
                }
                let mut entry = Map::new();
                entry.insert("date".into(), json!(local_date.to_string()));
                entry.insert("area".into(), json!(area));
                entry.insert("severity".into(), json!(severity as i64));
                if let Some(n) = event.data.get_str("notes") {
                    entry.insert("notes".into(), json!(n));
                }
                soreness_entries.push(Value::Object(entry));
            }
            "energy.logged" => {
                crate::shared::note_unknown_fields(&mut dq, event, KNOWN_ENERGY);
                let Some(level) = event.data.get_f64("level") else {
                    continue;
                };
                if !(1.0..=10.0).contains(&level) {
                    dq.add_anomaly("energy_level_out_of_range", format!("energy level {level} outside 1-10 scale"), json!({"event_id": event.event_id, "value": level}));
                }
                let mut entry = Map::new();
                entry.insert("date".into(), json!(local_date.to_string()));
                entry.insert("level".into(), json!(level));
                if let Some(t) = event.data.get_str("time_of_day") {
                    entry.insert("time_of_day".into(), json!(t));
                }
                energy_entries.push(Value::Object(entry));
                energy_by_week.entry(iso_week_key(local_date)).or_default().push(level);
            }
            _ => {}
        }
    }

    let sleep = weekly_section(&sleep_entries, &sleep_by_week, "duration_hours", "avg_duration_hours");
    let energy = weekly_section(&energy_entries, &energy_by_week, "level", "avg_level");

    let mut soreness = json!({"total_entries": soreness_entries.len()});
    if !soreness_entries.is_empty() {
        let mut current_by_area: BTreeMap<String, Value> = BTreeMap::new();
        for entry in &soreness_entries {
            current_by_area.insert(entry["area"].as_str().unwrap_or_default().to_string(), entry.clone());
        }
        soreness["current"] = json!(current_by_area.into_values().collect::<Vec<_>>());
        soreness["recent_entries"] = json!(tail(&soreness_entries, RECENT_LIMIT));
    }

    let mut out = json!({
        "sleep": sleep,
        "soreness": soreness,
        "energy": energy,
        "data_quality": dq.into_value(),
    });
    if let Some(target) = sleep_target {
        out["targets"] = json!({"sleep": target});
    }
    out
}

fn weekly_section(entries: &[Value], by_week: &BTreeMap<String, Vec<f64>>, field: &str, avg_key: &str) -> Value {
    if entries.is_empty() {
        return json!({});
    }
    let mut weeks: Vec<&String> = by_week.keys().collect();
    weeks.sort();
    if weeks.len() > WEEKLY_WEEKS {
        let drop = weeks.len() - WEEKLY_WEEKS;
        weeks.drain(0..drop);
    }
    let weekly_average: Vec<Value> = weeks
        .iter()
        .map(|week| {
            let values = &by_week[*week];
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            json!({"week": week, (avg_key): round_n(avg, 1), "entries": values.len()})
        })
        .collect();
    let all: Vec<f64> = entries.iter().filter_map(|e| e[field].as_f64()).collect();
    let overall_avg = all.iter().sum::<f64>() / all.len().max(1) as f64;
    json!({
        "recent_entries": tail(entries, RECENT_LIMIT),
        "weekly_average": weekly_average,
        "overall": {(avg_key): round_n(overall_avg, 1), "total_entries": entries.len()},
    })
}

fn tail(entries: &[Value], limit: usize) -> Vec<Value> {
    let start = entries.len().saturating_sub(limit);
    entries[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::UserId;

    fn event(event_type: &str, data: Value) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn sleep_outside_plausible_range_is_flagged() {
        let events = vec![event("sleep.logged", json!({"duration_hours": 25.0}))];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert!(!data["data_quality"]["anomalies"].as_array().unwrap().is_empty());
    }

    #[test]
    fn soreness_without_area_is_skipped() {
        let events = vec![event("soreness.logged", json!({"severity": 3}))];
        let data = build_overview(&events, None, chrono_tz::Tz::UTC);
        assert_eq!(data["soreness"]["total_entries"], json!(0));
    }
}
