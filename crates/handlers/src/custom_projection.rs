//! Custom projection engine (spec §4.4.9).
//!
//! Agent-declared rules materialize ad hoc per-user projections without a
//! dedicated handler per shape. A rule is itself event-sourced: the latest
//! surviving `projection_rule.created`/`projection_rule.archived` event per
//! rule name wins. Two rule kinds:
//!
//! - `field_tracking` — numeric fields lifted from named event types, rolled
//!   up into recent daily entries, weekly summaries, and all-time stats.
//! - `categorized_tracking` — events grouped by a declared field, rolled up
//!   into per-category counts, recent entries, and field min/max/avg.
//!
//! This handler owns the rule-lifecycle events (create/archive, registered
//! against [`RULE_LIFECYCLE_EVENT_TYPES`]); [`recompute_matching_rules`] and
//! [`has_matching_custom_rules`] are the hooks a dispatcher calls for every
//! other event type, since an arbitrary event might feed zero, one, or many
//! rules depending on what the user has declared.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kura_core::{EventId, Payload, UserId};
use kura_events::{Event, EventsResult};
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
use serde_json::{json, Value};

use crate::shared::{iso_week_key, local_date, round_n};

pub const PROJECTION_TYPE: &str = "custom";
pub const RULE_LIFECYCLE_EVENT_TYPES: &[&str] = &["projection_rule.created", "projection_rule.archived"];
const RECENT_ENTRIES_LIMIT: usize = 30;
const CATEGORY_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
enum RuleKind {
    FieldTracking,
    CategorizedTracking { group_by: String },
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    kind: RuleKind,
    source_events: Vec<String>,
    fields: Vec<String>,
}

/// Parses a `projection_rule.created` payload into a [`Rule`], rejecting
/// anything malformed rather than erroring — a bad rule is simply never
/// activated (spec §4.4.9's validation belongs at the write API, not here).
fn parse_rule(data: &Payload) -> Option<Rule> {
    let name = data.get_str("name")?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let source_events: Vec<String> = data.get_array("source_events")?.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    let fields: Vec<String> = data.get_array("fields")?.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    if source_events.is_empty() || fields.is_empty() {
        return None;
    }
    let kind = match data.get_str("type")? {
        "field_tracking" => RuleKind::FieldTracking,
        "categorized_tracking" => {
            let group_by = data.get_str("group_by")?.to_string();
            if !fields.contains(&group_by) {
                return None;
            }
            RuleKind::CategorizedTracking { group_by }
        }
        _ => return None,
    };
    Some(Rule { name, kind, source_events, fields })
}

/// Replays rule-lifecycle events chronologically; last event per rule name
/// wins. Returns only rules whose latest event was `created`.
fn active_rules(lifecycle_events: &[Event]) -> HashMap<String, Rule> {
    let mut active: HashMap<String, Rule> = HashMap::new();
    for event in lifecycle_events {
        match event.event_type.as_str() {
            "projection_rule.created" => {
                let Some(name) = event.data.get_str("name").map(str::to_string) else { continue };
                match parse_rule(&event.data) {
                    Some(rule) => {
                        active.insert(name, rule);
                    }
                    None => {
                        active.remove(&name);
                    }
                }
            }
            "projection_rule.archived" => {
                if let Some(name) = event.data.get_str("name") {
                    active.remove(name);
                }
            }
            _ => {}
        }
    }
    active
}

pub struct CustomProjectionHandler;

impl CustomProjectionHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CustomProjectionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for CustomProjectionHandler {
    fn dimension(&self) -> &'static str {
        PROJECTION_TYPE
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let user_id = invocation.user_id;
        let lifecycle = match ctx.events.query_by_type(user_id, RULE_LIFECYCLE_EVENT_TYPES).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };

        match invocation.event_type.as_str() {
            "projection_rule.archived" => {
                let Some(triggering) = lifecycle.iter().find(|e| e.event_id == invocation.event_id) else {
                    return HandlerOutcome::Completed;
                };
                let Some(name) = triggering.data.get_str("name") else { return HandlerOutcome::Completed };
                if let Err(e) = ctx.projections.delete(user_id, PROJECTION_TYPE, name).await {
                    return HandlerOutcome::Retryable(e.to_string());
                }
                HandlerOutcome::Completed
            }
            "projection_rule.created" => {
                let Some(triggering) = lifecycle.iter().find(|e| e.event_id == invocation.event_id) else {
                    return HandlerOutcome::Completed;
                };
                let Some(rule) = parse_rule(&triggering.data) else { return HandlerOutcome::Completed };
                // A later archive of the same name may have already landed by
                // the time this job runs; skip the now-stale compute.
                let still_active = active_rules(&lifecycle).get(&rule.name).map(|r| r.name == rule.name).unwrap_or(false);
                if !still_active {
                    return HandlerOutcome::Completed;
                }
                if let Err(e) = recompute_rule(ctx, user_id, &rule).await {
                    return HandlerOutcome::Retryable(e.to_string());
                }
                HandlerOutcome::Completed
            }
            _ => HandlerOutcome::Completed,
        }
    }
}

/// Called by the dispatcher for every event type that isn't a rule-lifecycle
/// event: true if some active rule declares `event_type` among its
/// `source_events` (spec §4.4.9's "should I even bother" check).
pub async fn has_matching_custom_rules(ctx: &HandlerContext, user_id: UserId, event_type: &str) -> EventsResult<bool> {
    let lifecycle = ctx.events.query_by_type(user_id, RULE_LIFECYCLE_EVENT_TYPES).await?;
    let rules = active_rules(&lifecycle);
    Ok(rules.values().any(|r| r.source_events.iter().any(|s| s == event_type)))
}

/// Recomputes every active rule whose `source_events` include `event_type`
/// (spec §4.4.9's router hook for regular, non-rule-lifecycle events).
pub async fn recompute_matching_rules(ctx: &HandlerContext, user_id: UserId, event_type: &str) -> EventsResult<()> {
    let lifecycle = ctx.events.query_by_type(user_id, RULE_LIFECYCLE_EVENT_TYPES).await?;
    let rules = active_rules(&lifecycle);
    for rule in rules.values() {
        if rule.source_events.iter().any(|s| s == event_type) {
            recompute_rule(ctx, user_id, rule).await?;
        }
    }
    Ok(())
}

async fn recompute_rule(ctx: &HandlerContext, user_id: UserId, rule: &Rule) -> EventsResult<()> {
    let event_type_refs: Vec<&str> = rule.source_events.iter().map(String::as_str).collect();
    let all = ctx.events.query_all(user_id).await?;
    let retracted: HashSet<EventId> = kura_corrections::retracted_ids(&all);
    let timezone = crate::shared::resolve_timezone(&kura_corrections::active_events(all));

    let source_events = ctx.events.query_by_type(user_id, &event_type_refs).await?;
    let events: Vec<Event> = source_events.into_iter().filter(|e| !retracted.contains(&e.event_id)).collect();

    let last_event_id = events.last().map(|e| e.event_id);
    let data = match &rule.kind {
        RuleKind::FieldTracking => compute_field_tracking(&events, &rule.fields, timezone),
        RuleKind::CategorizedTracking { group_by } => compute_categorized_tracking(&events, &rule.fields, group_by, timezone),
    };

    let write = kura_events::ProjectionWrite::new(user_id, PROJECTION_TYPE, rule.name.clone(), Payload::new(data), last_event_id);
    ctx.projections.upsert(write).await?;
    Ok(())
}

fn compute_field_tracking(events: &[Event], fields: &[String], timezone: chrono_tz::Tz) -> Value {
    #[derive(Default)]
    struct FieldStats {
        sum: f64,
        count: usize,
        min: f64,
        max: f64,
    }

    let mut by_day: BTreeMap<NaiveDate, HashMap<String, f64>> = BTreeMap::new();
    let mut all_time: HashMap<String, FieldStats> = HashMap::new();
    let mut temporal_conflicts = 0u64;
    let mut fields_present: HashSet<String> = HashSet::new();

    for event in events {
        let day = local_date(event.timestamp, timezone);
        let day_bucket = by_day.entry(day).or_default();
        for field in fields {
            let Some(value) = event.data.get_f64(field) else { continue };
            fields_present.insert(field.clone());
            if day_bucket.contains_key(field) {
                temporal_conflicts += 1;
            }
            day_bucket.insert(field.clone(), value);

            let stats = all_time.entry(field.clone()).or_insert(FieldStats { sum: 0.0, count: 0, min: f64::MAX, max: f64::MIN });
            stats.sum += value;
            stats.count += 1;
            stats.min = stats.min.min(value);
            stats.max = stats.max.max(value);
        }
    }

    let recent_entries: Vec<Value> = by_day
        .iter()
        .rev()
        .take(RECENT_ENTRIES_LIMIT)
        .map(|(day, values)| {
            let mut obj = serde_json::Map::new();
            obj.insert("date".to_string(), json!(day.to_string()));
            for (field, value) in values {
                obj.insert(field.clone(), json!(round_n(*value, 3)));
            }
            Value::Object(obj)
        })
        .rev()
        .collect();

    let mut weekly: BTreeMap<String, HashMap<String, Vec<f64>>> = BTreeMap::new();
    for (day, values) in &by_day {
        let week = weekly.entry(iso_week_key(*day)).or_default();
        for (field, value) in values {
            week.entry(field.clone()).or_default().push(*value);
        }
    }
    let weekly_summary: Vec<Value> = weekly
        .into_iter()
        .map(|(week, field_values)| {
            let mut obj = serde_json::Map::new();
            obj.insert("week".to_string(), json!(week));
            for (field, values) in field_values {
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                obj.insert(field, json!(round_n(avg, 3)));
            }
            Value::Object(obj)
        })
        .collect();

    let all_time_value: Value = all_time
        .into_iter()
        .map(|(field, stats)| {
            (
                field,
                json!({
                    "count": stats.count,
                    "avg": round_n(stats.sum / stats.count as f64, 3),
                    "min": round_n(stats.min, 3),
                    "max": round_n(stats.max, 3),
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    json!({
        "kind": "field_tracking",
        "fields": fields,
        "recent_entries": recent_entries,
        "weekly_summary": weekly_summary,
        "all_time": all_time_value,
        "data_quality": {
            "total_events_processed": events.len(),
            "fields_present": fields_present.into_iter().collect::<Vec<_>>(),
            "temporal_conflicts": temporal_conflicts,
        },
    })
}

fn compute_categorized_tracking(events: &[Event], fields: &[String], group_by: &str, timezone: chrono_tz::Tz) -> Value {
    #[derive(Default)]
    struct Category {
        count: u64,
        recent: Vec<Value>,
        field_values: HashMap<String, Vec<f64>>,
    }

    let mut categories: BTreeMap<String, Category> = BTreeMap::new();
    for event in events {
        let category_key = event.data.get_str(group_by).map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).unwrap_or_else(|| "_unknown".to_string());
        let bucket = categories.entry(category_key).or_default();
        bucket.count += 1;

        let day = local_date(event.timestamp, timezone);
        let mut entry = serde_json::Map::new();
        entry.insert("date".to_string(), json!(day.to_string()));
        for field in fields {
            if let Some(value) = event.data.get_f64(field) {
                bucket.field_values.entry(field.clone()).or_default().push(value);
                entry.insert(field.clone(), json!(round_n(value, 3)));
            } else if let Some(s) = event.data.get_str(field) {
                entry.insert(field.clone(), json!(s));
            }
        }
        bucket.recent.push(Value::Object(entry));
    }

    let categories_value: Value = categories
        .into_iter()
        .map(|(name, bucket)| {
            let recent_len = bucket.recent.len();
            let recent = bucket.recent.into_iter().skip(recent_len.saturating_sub(CATEGORY_RECENT_LIMIT)).collect::<Vec<_>>();
            let field_stats: serde_json::Map<String, Value> = bucket
                .field_values
                .into_iter()
                .map(|(field, values)| {
                    let avg = values.iter().sum::<f64>() / values.len() as f64;
                    let min = values.iter().cloned().fold(f64::MAX, f64::min);
                    let max = values.iter().cloned().fold(f64::MIN, f64::max);
                    (field, json!({"avg": round_n(avg, 3), "min": round_n(min, 3), "max": round_n(max, 3)}))
                })
                .collect();
            (name, json!({"count": bucket.count, "recent_entries": recent, "fields": field_stats}))
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    json!({
        "kind": "categorized_tracking",
        "group_by": group_by,
        "fields": fields,
        "categories": categories_value,
        "data_quality": {
            "total_events_processed": events.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::UserId;
    use serde_json::json;

    fn lifecycle_event(event_type: &str, data: Value, ts: DateTime<Utc>) -> Event {
        Event { event_id: EventId::new(), user_id: UserId::new(), timestamp: ts, event_type: event_type.to_string(), data: Payload::new(data), metadata: Payload::empty() }
    }

    #[test]
    fn archived_rule_removes_from_active_set() {
        let t0 = Utc::now();
        let events = vec![
            lifecycle_event("projection_rule.created", json!({"name": "hrv", "type": "field_tracking", "source_events": ["sleep.logged"], "fields": ["hrv_rmssd"]}), t0),
            lifecycle_event("projection_rule.archived", json!({"name": "hrv"}), t0 + chrono::Duration::seconds(1)),
        ];
        assert!(active_rules(&events).is_empty());
    }

    #[test]
    fn categorized_rule_requires_group_by_in_fields() {
        let data = Payload::new(json!({"name": "supps", "type": "categorized_tracking", "source_events": ["supplement.logged"], "fields": ["dose_mg"], "group_by": "name"}));
        assert!(parse_rule(&data).is_none());
    }

    #[test]
    fn field_tracking_rollup_has_expected_shape() {
        let t0 = Utc::now();
        let events = vec![
            lifecycle_event("sleep.logged", json!({"hrv_rmssd": 42.0}), t0),
            lifecycle_event("sleep.logged", json!({"hrv_rmssd": 46.0}), t0 + chrono::Duration::days(1)),
        ];
        let data = compute_field_tracking(&events, &["hrv_rmssd".to_string()], chrono_tz::Tz::UTC);
        assert_eq!(data["all_time"]["hrv_rmssd"]["count"], json!(2));
    }

    #[test]
    fn categorized_rollup_groups_by_field() {
        let t0 = Utc::now();
        let events = vec![
            lifecycle_event("supplement.logged", json!({"name": "creatine", "dose_mg": 5000.0}), t0),
            lifecycle_event("supplement.logged", json!({"name": "Creatine", "dose_mg": 5000.0}), t0 + chrono::Duration::days(1)),
        ];
        let data = compute_categorized_tracking(&events, &["name".to_string(), "dose_mg".to_string()], "name", chrono_tz::Tz::UTC);
        assert_eq!(data["categories"]["creatine"]["count"], json!(2));
    }
}
