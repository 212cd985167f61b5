//! Helpers every handler in this crate shares (spec §4.4 "shared contract"):
//! loading retraction/alias context, resolving a user's timezone, the Epley
//! 1RM formula, session-key resolution, and the `data_quality` subsection
//! every projection payload carries.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use kura_core::{EventId, Payload, UserId};
use kura_corrections::{active_events, retracted_ids, AliasMap};
use kura_events::{Event, EventsResult, InferenceRun, InferenceStatus};
use kura_registry::HandlerContext;
use serde_json::{json, Map, Value};
use tracing::warn;

/// Retraction/alias context, loaded once per handler invocation from the
/// user's full event tail (spec §4.4 steps 1-2).
pub struct UserContext {
    pub retracted: HashSet<EventId>,
    pub alias_map: AliasMap,
    pub timezone: Tz,
}

/// Fetch the full event tail, compute the retracted-id set, build the alias
/// map from surviving `exercise.alias_created` events, and resolve the
/// user's configured timezone (falls back to UTC, spec §4.6.1 INV-003).
pub async fn load_user_context(ctx: &HandlerContext, user_id: UserId) -> EventsResult<UserContext> {
    let all = ctx.events.query_all(user_id).await?;
    let retracted = retracted_ids(&all);
    let surviving = active_events(all);
    let alias_map = AliasMap::build(&surviving);
    let timezone = resolve_timezone(&surviving);
    Ok(UserContext { retracted, alias_map, timezone })
}

/// Fetch events of the given types and drop anything retracted (spec §4.4
/// steps 2-4; events already arrive chronologically from the store).
pub async fn load_active_typed_events(ctx: &HandlerContext, user_id: UserId, event_types: &[&str], retracted: &HashSet<EventId>) -> EventsResult<Vec<Event>> {
    let events = ctx.events.query_by_type(user_id, event_types).await?;
    Ok(events.into_iter().filter(|e| !retracted.contains(&e.event_id)).collect())
}

/// Latest explicit `preference.set` with key `timezone`/`time_zone`, parsed
/// as an IANA zone name; `Tz::UTC` if absent or unparseable.
pub fn resolve_timezone(events: &[Event]) -> Tz {
    let mut resolved = Tz::UTC;
    for event in events {
        if event.event_type != "preference.set" {
            continue;
        }
        let key = event.data.normalized_str("key");
        if key != "timezone" && key != "time_zone" {
            continue;
        }
        if let Some(value) = event.data.get_str("value") {
            if let Ok(tz) = value.trim().parse::<Tz>() {
                resolved = tz;
            }
        }
    }
    resolved
}

/// Epley estimated 1RM: `weight * (1 + reps/30)` (spec §4.4.1).
pub fn epley_1rm(weight_kg: f64, reps: f64) -> f64 {
    weight_kg * (1.0 + reps / 30.0)
}

/// The session key for a `set.logged`-derived row: explicit
/// `metadata.session_id` wins, else the day-boundary fallback (spec §3.2,
/// §4.4.1).
pub fn session_key_for(session_id: Option<&str>, timestamp: DateTime<Utc>, timezone: Tz) -> String {
    match session_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => kura_corrections::fallback_session_key(timestamp, timezone),
    }
}

/// ISO week key, e.g. `"2026-W05"` (spec §4.4.1 weekly rollups, §4.4.2).
pub fn iso_week_key(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

pub fn local_date(timestamp: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    timestamp.with_timezone(&timezone).date_naive()
}

pub fn round_n(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Accumulates the `data_quality` subsection every handler's payload carries
/// (spec §4.4 step 5): anomalies, observed-but-unknown attributes, temporal
/// conflicts, field hints.
#[derive(Debug, Default)]
pub struct DataQuality {
    anomalies: Vec<Value>,
    observed_unknown_attributes: Map<String, Value>,
    temporal_conflicts: Vec<Value>,
    field_hints: Vec<Value>,
    schema_capabilities: Vec<Value>,
}

impl DataQuality {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_anomaly(&mut self, code: &str, detail: impl Into<String>, context: Value) {
        self.anomalies.push(json!({"code": code, "detail": detail.into(), "context": context}));
    }

    pub fn add_temporal_conflict(&mut self, detail: impl Into<String>, context: Value) {
        self.temporal_conflicts.push(json!({"detail": detail.into(), "context": context}));
    }

    pub fn add_field_hint(&mut self, field: &str, hint: impl Into<String>) {
        self.field_hints.push(json!({"field": field, "hint": hint.into()}));
    }

    /// Record an attribute present on an event but not recognized by this
    /// handler's fixed field set, grouped by event type (spec §4.4 step 5).
    pub fn note_unknown_attribute(&mut self, event_type: &str, attribute: &str) {
        let entry = self.observed_unknown_attributes.entry(event_type.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            let already = items.iter().any(|v| v.as_str() == Some(attribute));
            if !already {
                items.push(Value::String(attribute.to_string()));
            }
        }
    }

    /// Record that an optional relation this handler would have enriched
    /// from is absent in the deployed schema (spec §A.6). The handler
    /// should have already applied whatever fallback the gap implies; this
    /// just makes the degradation visible in the projection payload.
    pub fn note_schema_capability_gap(&mut self, relation_name: &str, fallback_behavior: &str) {
        self.schema_capabilities.push(json!({"relation_name": relation_name, "status": "missing", "fallback_behavior": fallback_behavior}));
    }

    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
            && self.observed_unknown_attributes.is_empty()
            && self.temporal_conflicts.is_empty()
            && self.field_hints.is_empty()
            && self.schema_capabilities.is_empty()
    }

    pub fn into_value(self) -> Value {
        json!({
            "anomalies": self.anomalies,
            "observed_unknown_attributes": Value::Object(self.observed_unknown_attributes),
            "temporal_conflicts": self.temporal_conflicts,
            "field_hints": self.field_hints,
            "schema_capabilities": self.schema_capabilities,
        })
    }
}

/// Record one inference-engine invocation's telemetry (spec §3.1, §7).
/// Best-effort: a telemetry write failure never fails the handler itself,
/// since the projection write is the outcome that matters.
#[allow(clippy::too_many_arguments)]
pub async fn record_inference_run(
    ctx: &HandlerContext,
    user_id: UserId,
    projection_type: &str,
    key: &str,
    engine: &str,
    status: InferenceStatus,
    diagnostics: Value,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
) {
    let error_taxonomy = error_message.as_deref().map(kura_events::ErrorTaxonomy::classify);
    let run = InferenceRun {
        user_id,
        projection_type: projection_type.to_string(),
        key: key.to_string(),
        engine: engine.to_string(),
        status,
        diagnostics: Payload::new(diagnostics),
        error_message,
        error_taxonomy,
        started_at,
        completed_at: Utc::now(),
    };
    if let Err(e) = ctx.inference_runs.record(run).await {
        warn!(error = %e, projection_type, key, "failed to record inference run");
    }
}

/// Note every key on `data` not in `known_fields` as an unknown attribute
/// (spec §4.4 step 5's "observed-but-unknown attributes" requirement).
pub fn note_unknown_fields(dq: &mut DataQuality, event: &Event, known_fields: &[&str]) {
    for key in event.data.keys() {
        if !known_fields.contains(&key.as_str()) {
            dq.note_unknown_attribute(&event.event_type, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone as _, Utc};
    use kura_core::Payload;
    use serde_json::json;

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
    fn epley_formula_matches_spec() {
        assert_eq!(round_n(epley_1rm(100.0, 5.0), 3), 116.667);
    }

    #[test]
    fn resolves_explicit_timezone_preference() {
        let events = vec![event("preference.set", json!({"key": "timezone", "value": "Europe/Berlin"}))];
        assert_eq!(resolve_timezone(&events), Tz::Europe__Berlin);
    }

    #[test]
    fn defaults_to_utc_without_preference() {
        assert_eq!(resolve_timezone(&[]), Tz::UTC);
    }

    #[test]
    fn iso_week_key_has_expected_shape() {
        let date = Utc.with_ymd_and_hms(2026, 1, 28, 0, 0, 0).unwrap().date_naive();
        assert_eq!(iso_week_key(date), "2026-W05");
    }

    #[test]
    fn unknown_attribute_recorded_once_per_field() {
        let mut dq = DataQuality::new();
        let row = event("set.logged", json!({"weight_kg": 100, "rpe": 8}));
        note_unknown_fields(&mut dq, &row, &["weight_kg"]);
        note_unknown_fields(&mut dq, &row, &["weight_kg"]);
        let value = dq.into_value();
        let unknowns = value["observed_unknown_attributes"]["set.logged"].as_array().unwrap();
        assert_eq!(unknowns.len(), 1);
    }
}
