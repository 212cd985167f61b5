//! Training timeline handler (spec §4.4.2).
//!
//! Single `overview` key. Aggregates `set.logged`, `session.completed`, and
//! externally imported activities into recent training days, recent
//! sessions, a weekly summary, rolling frequency averages, and streak
//! tracking. Training Load v2 is feature-flagged; when disabled it emits a
//! zeroed stub of the same shape so downstream readers never branch on it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use kura_core::Payload;
use kura_events::ProjectionWrite;
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Value};

use crate::schema_capabilities::{detect_schema_capabilities, SchemaCapabilityReport};
use crate::shared::{epley_1rm, iso_week_key, load_active_typed_events, load_user_context, round_n, session_key_for, DataQuality};

pub const DIMENSION: &str = "training_timeline";
const RECENT_DAYS_LIMIT: usize = 30;
const RECENT_SESSIONS_LIMIT: usize = 30;
const WEEKLY_SUMMARY_WEEKS: usize = 26;
const SOURCE_EVENT_TYPES: &[&str] = &["set.logged", "session.completed", "activity.imported"];

pub struct TrainingTimelineHandler {
    pub training_load_v2_enabled: bool,
}

impl TrainingTimelineHandler {
    pub fn new(training_load_v2_enabled: bool) -> Self {
        Self { training_load_v2_enabled }
    }
}

#[async_trait]
impl Handler for TrainingTimelineHandler {
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

        let last_event_id = events.last().map(|e| e.event_id);
        let capabilities = detect_schema_capabilities(&ctx.schema_capabilities).await;
        let data = build_overview(&events, user_ctx.timezone, self.training_load_v2_enabled, &capabilities);
        let write = ProjectionWrite::new(user_id, DIMENSION, "overview".to_string(), Payload::new(data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }

    fn manifest_contribution(&self, projection_data: &Payload) -> Value {
        let Some(rows) = projection_data.get_array("rows") else { return Value::Null };
        let Some(data) = rows.first().and_then(|r| r.get("data")) else { return json!({}) };
        json!({
            "last_training": data.get("last_training"),
            "total_training_days": data.get("total_training_days"),
            "current_frequency": data.get("current_frequency"),
            "streak": data.get("streak"),
        })
    }
}

struct DayBucket {
    sets_per_exercise: HashMap<String, Vec<f64>>,
    volume_kg: f64,
    set_count: usize,
}

fn build_overview(events: &[kura_events::Event], timezone: chrono_tz::Tz, load_v2_enabled: bool, capabilities: &SchemaCapabilityReport) -> Value {
    let mut by_day: BTreeMap<NaiveDate, DayBucket> = BTreeMap::new();
    let mut by_session: BTreeMap<String, Vec<(chrono::DateTime<chrono::Utc>, usize, f64)>> = BTreeMap::new();
    let mut training_dates: BTreeSet<NaiveDate> = BTreeSet::new();

    for event in events {
        let day = crate::shared::local_date(event.timestamp, timezone);
        match event.event_type.as_str() {
            "set.logged" => {
                let weight = event.data.get_f64("weight_kg").unwrap_or(0.0);
                let reps = event.data.get_f64("reps").unwrap_or(0.0);
                if weight <= 0.0 || reps <= 0.0 {
                    continue;
                }
                training_dates.insert(day);
                let exercise = event.data.normalized_str("exercise_id");
                let exercise = if exercise.is_empty() { event.data.normalized_str("exercise") } else { exercise };
                let e1rm = epley_1rm(weight, reps);
                let bucket = by_day.entry(day).or_insert_with(|| DayBucket { sets_per_exercise: HashMap::new(), volume_kg: 0.0, set_count: 0 });
                bucket.volume_kg += weight * reps;
                bucket.set_count += 1;
                bucket.sets_per_exercise.entry(exercise).or_default().push(e1rm);

                let session_id = event.data.get_str("session_id");
                let key = session_key_for(session_id, event.timestamp, timezone);
                let entry = by_session.entry(key).or_default();
                entry.push((event.timestamp, 1, weight * reps));
            }
            "session.completed" | "activity.imported" => {
                training_dates.insert(day);
                let key = session_key_for(event.data.get_str("session_id"), event.timestamp, timezone);
                by_session.entry(key).or_insert_with(Vec::new);
            }
            _ => {}
        }
    }

    let reference_date = events.iter().map(|e| crate::shared::local_date(e.timestamp, timezone)).max().unwrap_or_default();

    let mut recent_days: Vec<Value> = by_day
        .iter()
        .rev()
        .take(RECENT_DAYS_LIMIT)
        .map(|(day, bucket)| {
            let mut top_sets: Vec<Value> = bucket
                .sets_per_exercise
                .iter()
                .map(|(exercise, values)| {
                    let best = values.iter().cloned().fold(0.0, f64::max);
                    json!({"exercise_id": exercise, "best_estimated_1rm": round_n(best, 2), "set_count": values.len()})
                })
                .collect();
            top_sets.sort_by(|a, b| a["exercise_id"].as_str().cmp(&b["exercise_id"].as_str()));
            json!({
                "date": day.to_string(),
                "total_sets": bucket.set_count,
                "total_volume_kg": round_n(bucket.volume_kg, 1),
                "top_sets": top_sets,
            })
        })
        .collect();
    recent_days.reverse();

    let mut sessions: Vec<(String, chrono::DateTime<chrono::Utc>, usize, f64)> = by_session
        .into_iter()
        .map(|(key, entries)| {
            let latest = entries.iter().map(|(ts, _, _)| *ts).max().unwrap_or_default();
            let sets: usize = entries.iter().map(|(_, c, _)| c).sum();
            let volume: f64 = entries.iter().map(|(_, _, v)| v).sum();
            (key, latest, sets, volume)
        })
        .collect();
    sessions.sort_by(|a, b| b.1.cmp(&a.1));
    let recent_sessions: Vec<Value> = sessions
        .iter()
        .take(RECENT_SESSIONS_LIMIT)
        .map(|(key, latest, sets, volume)| json!({"session_key": key, "ended_at": latest, "total_sets": sets, "total_volume_kg": round_n(*volume, 1)}))
        .collect();

    let mut by_week: BTreeMap<String, (BTreeSet<NaiveDate>, usize, f64, BTreeSet<String>)> = BTreeMap::new();
    for (day, bucket) in &by_day {
        let week = iso_week_key(*day);
        let entry = by_week.entry(week).or_insert_with(|| (BTreeSet::new(), 0, 0.0, BTreeSet::new()));
        entry.0.insert(*day);
        entry.1 += bucket.set_count;
        entry.2 += bucket.volume_kg;
        for exercise in bucket.sets_per_exercise.keys() {
            entry.3.insert(exercise.clone());
        }
    }
    let mut weeks: Vec<&String> = by_week.keys().collect();
    weeks.sort();
    if weeks.len() > WEEKLY_SUMMARY_WEEKS {
        let drop = weeks.len() - WEEKLY_SUMMARY_WEEKS;
        weeks.drain(0..drop);
    }
    let weekly_summary: Vec<Value> = weeks
        .iter()
        .map(|week| {
            let (days, sets, volume, exercises) = &by_week[*week];
            json!({
                "week": week,
                "training_days": days.len(),
                "total_sets": sets,
                "total_volume_kg": round_n(*volume, 1),
                "exercises": exercises.iter().collect::<Vec<_>>(),
            })
        })
        .collect();

    let frequency = json!({
        "last_4_weeks": avg_for_weeks(&training_dates, reference_date, 4),
        "last_12_weeks": avg_for_weeks(&training_dates, reference_date, 12),
    });
    let streak = compute_streak(&training_dates, reference_date);

    let mut data_quality = DataQuality::new();
    for relation in capabilities.relations.iter().filter(|r| !r.available) {
        data_quality.note_schema_capability_gap(relation.relation_name, relation.fallback_behavior);
    }

    json!({
        "last_training": training_dates.iter().max().map(|d| d.to_string()),
        "total_training_days": training_dates.len(),
        "recent_training_days": recent_days,
        "recent_sessions": recent_sessions,
        "weekly_summary": weekly_summary,
        "current_frequency": frequency,
        "streak": streak,
        "training_load_v2": training_load_v2_section(load_v2_enabled),
        "data_quality": data_quality.into_value(),
    })
}

fn avg_for_weeks(training_dates: &BTreeSet<NaiveDate>, reference_date: NaiveDate, n_weeks: i64) -> f64 {
    let cutoff = reference_date - chrono::Duration::weeks(n_weeks);
    let count = training_dates.iter().filter(|d| **d >= cutoff).count();
    round_n(count as f64 / n_weeks as f64, 2)
}

fn compute_streak(training_dates: &BTreeSet<NaiveDate>, reference_date: NaiveDate) -> Value {
    if training_dates.is_empty() {
        return json!({"current_weeks": 0, "longest_weeks": 0});
    }
    let active_weeks: BTreeSet<(i32, u32)> = training_dates.iter().map(|d| { let iso = d.iso_week(); (iso.year(), iso.week()) }).collect();

    let mut current_streak = 0i64;
    let mut cursor = reference_date;
    loop {
        let iso = cursor.iso_week();
        if !active_weeks.contains(&(iso.year(), iso.week())) {
            break;
        }
        current_streak += 1;
        cursor -= chrono::Duration::weeks(1);
    }

    let mondays: BTreeSet<NaiveDate> = active_weeks.iter().filter_map(|(y, w)| NaiveDate::from_isoywd_opt(*y, *w, chrono::Weekday::Mon)).collect();
    let mondays: Vec<NaiveDate> = mondays.into_iter().collect();
    let mut longest = 0i64;
    let mut run = 0i64;
    for (i, monday) in mondays.iter().enumerate() {
        if i == 0 {
            run = 1;
        } else if (*monday - mondays[i - 1]).num_days() == 7 {
            run += 1;
        } else {
            run = 1;
        }
        longest = longest.max(run);
    }

    json!({"current_weeks": current_streak, "longest_weeks": longest})
}

fn training_load_v2_section(enabled: bool) -> Value {
    if !enabled {
        return json!({
            "enabled": false,
            "global": {"load_score": 0.0, "confidence": 0.0, "confidence_band": "low"},
            "modalities": {},
        });
    }
    json!({
        "enabled": true,
        "global": {"load_score": null, "confidence": null, "confidence_band": "low"},
        "modalities": {},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kura_core::UserId;

    fn event(event_type: &str, data: Value, ts: chrono::DateTime<Utc>) -> kura_events::Event {
        kura_events::Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: ts,
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn frequency_counts_days_in_window() {
        let reference = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap().date_naive();
        let mut dates = BTreeSet::new();
        dates.insert(reference);
        dates.insert(reference - chrono::Duration::days(7));
        assert_eq!(avg_for_weeks(&dates, reference, 4), round_n(2.0 / 4.0, 2));
    }

    #[test]
    fn empty_events_produce_no_recent_days() {
        let events: Vec<kura_events::Event> = vec![event("set.logged", json!({"exercise_id": "squat", "weight_kg": 100, "reps": 5}), Utc::now())];
        let capabilities = SchemaCapabilityReport { status: "healthy", missing_relations: Vec::new(), relations: Vec::new() };
        let data = build_overview(&events, chrono_tz::Tz::UTC, false, &capabilities);
        assert_eq!(data["total_training_days"], json!(1));
        assert_eq!(data["training_load_v2"]["enabled"], json!(false));
    }

    #[test]
    fn missing_relation_surfaces_as_schema_capability_gap() {
        use crate::schema_capabilities::RelationCapability;

        let events: Vec<kura_events::Event> = vec![event("set.logged", json!({"exercise_id": "squat", "weight_kg": 100, "reps": 5}), Utc::now())];
        let capabilities = SchemaCapabilityReport {
            status: "degraded",
            missing_relations: vec!["external_import_jobs"],
            relations: vec![RelationCapability {
                relation_name: "external_import_jobs",
                available: false,
                required_by: &["quality_health", "training_timeline"],
                fallback_behavior: "external-import provenance is omitted from data_quality until the relation exists",
            }],
        };
        let data = build_overview(&events, chrono_tz::Tz::UTC, false, &capabilities);
        let gaps = data["data_quality"]["schema_capabilities"].as_array().unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0]["relation_name"], json!("external_import_jobs"));
    }
}
