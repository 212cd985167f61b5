//! User profile — the agent's three-layer entry point (spec §4.4.8).
//!
//! Full recompute on every relevant event, keyed `me`. Aggregates three
//! layers:
//!
//! - `system` — static capabilities: dimension descriptions sourced from the
//!   registry, the event catalog, normalization conventions, and the
//!   interview guide. Identical for every user.
//! - `user` — per-user identity (aliases, preferences, goals, profile,
//!   injuries), dimension coverage (calling each dimension's
//!   `manifest_contribution`), interview coverage, and actionable
//!   data-quality items.
//! - `agenda` — proactive priority items: onboarding, profile refresh,
//!   unresolved exercises, unconfirmed aliases.
//!
//! Needs read access to the registry this handler is itself a member of (to
//! enumerate dimensions and call their `manifest_contribution` hooks), so it
//! uses the same deferred `Arc<OnceLock<Registry>>` handle as the quality
//! health handler — and must be the last handler `register_all` registers,
//! since its system layer reflects every other dimension.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use kura_core::Payload;
use kura_events::Event;
use kura_registry::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome, Registry};
use serde_json::{json, Value};

pub const DIMENSION: &str = "user_profile";

pub const RELEVANT_EVENT_TYPES: &[&str] = &[
    "set.logged",
    "exercise.alias_created",
    "preference.set",
    "goal.set",
    "profile.updated",
    "injury.reported",
    "bodyweight.logged",
    "measurement.logged",
    "sleep.logged",
    "soreness.logged",
    "energy.logged",
    "meal.logged",
    "training_plan.created",
    "training_plan.updated",
    "training_plan.archived",
    "nutrition_target.set",
    "sleep_target.set",
    "weight_target.set",
];

const COVERAGE_AREAS: &[&str] =
    &["training_background", "goals", "exercise_vocabulary", "unit_preferences", "injuries", "equipment", "schedule", "nutrition_interest", "current_program"];

pub struct UserProfileHandler {
    registry: Arc<OnceLock<Registry>>,
}

impl UserProfileHandler {
    /// `registry` is the cell `register_all` populates once the full
    /// registry (this handler included) is built.
    pub fn new(registry: Arc<OnceLock<Registry>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler for UserProfileHandler {
    fn dimension(&self) -> &'static str {
        DIMENSION
    }

    async fn handle(&self, ctx: &HandlerContext, invocation: &HandlerInvocation) -> HandlerOutcome {
        let Some(registry) = self.registry.get() else {
            return HandlerOutcome::Retryable("user_profile registry not yet initialized".to_string());
        };
        let user_id = invocation.user_id;

        let all_events = match ctx.events.query_all(user_id).await {
            Ok(events) => events,
            Err(e) => return HandlerOutcome::Retryable(e.to_string()),
        };
        if all_events.is_empty() {
            return HandlerOutcome::Completed;
        }
        let retracted = kura_corrections::retracted_ids(&all_events);
        let events: Vec<Event> = all_events.iter().filter(|e| !retracted.contains(&e.event_id)).cloned().collect();
        if events.is_empty() {
            return HandlerOutcome::Completed;
        }

        let identity = scan_identity(&events);
        let unconfirmed_aliases = identity.aliases.iter().filter(|(_, info)| info.confidence != "confirmed").map(|(alias, info)| (alias.clone(), info.clone())).collect::<Vec<_>>();

        let alias_lookup: HashMap<String, String> = identity.aliases.iter().map(|(alias, info)| (alias.trim().to_lowercase(), info.target.clone())).collect();
        let mut unresolved_exercises: Vec<String> = identity.raw_exercises_without_id.iter().filter(|ex| !alias_lookup.contains_key(*ex)).cloned().collect();
        unresolved_exercises.sort();
        let resolved_exercises: std::collections::BTreeSet<String> = identity.exercises_logged.iter().map(|ex| alias_lookup.get(ex).cloned().unwrap_or_else(|| ex.clone())).collect();

        let mut event_type_counts: HashMap<String, u64> = HashMap::new();
        for event in &events {
            *event_type_counts.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        let orphaned_event_types = find_orphaned_event_types(registry, &event_type_counts);

        let interview_coverage = compute_interview_coverage(&identity);

        let system_layer = build_system_layer(registry);
        let user_dimensions = build_user_dimensions(ctx, registry, user_id, &identity.set_logged_range).await;
        let data_quality = build_data_quality(identity.total_set_logged, identity.events_without_exercise_id, &unresolved_exercises, &identity.exercise_occurrences, &unconfirmed_aliases, &orphaned_event_types);

        let unresolved_items: Vec<Value> = unresolved_exercises.iter().map(|ex| json!({"exercise": ex, "occurrences": identity.exercise_occurrences.get(ex).copied().unwrap_or(0)})).collect();
        let agenda = build_agenda(&unresolved_items, &unconfirmed_aliases, &interview_coverage, identity.total_events, !identity.goals.is_empty(), !identity.preferences.is_empty());

        let aliases_value: Value = identity.aliases.iter().map(|(alias, info)| (alias.clone(), json!({"target": info.target, "confidence": info.confidence}))).collect::<serde_json::Map<_, _>>().into();

        let projection_data = json!({
            "system": system_layer,
            "user": {
                "aliases": aliases_value,
                "preferences": identity.preferences,
                "goals": identity.goals,
                "profile": if identity.profile_data.is_empty() { Value::Null } else { Value::Object(identity.profile_data.clone()) },
                "injuries": if identity.injuries.is_empty() { Value::Null } else { Value::Array(identity.injuries.clone()) },
                "exercises_logged": resolved_exercises.into_iter().collect::<Vec<_>>(),
                "total_events": identity.total_events,
                "first_event": events.first().map(|e| e.timestamp.to_rfc3339()),
                "last_event": events.last().map(|e| e.timestamp.to_rfc3339()),
                "dimensions": user_dimensions,
                "data_quality": data_quality,
                "interview_coverage": interview_coverage,
            },
            "agenda": agenda,
        });

        let last_event_id = events.last().map(|e| e.event_id);
        let write = kura_events::ProjectionWrite::new(user_id, DIMENSION, "me".to_string(), Payload::new(projection_data), last_event_id);
        if let Err(e) = ctx.projections.upsert(write).await {
            return HandlerOutcome::Retryable(e.to_string());
        }
        HandlerOutcome::Completed
    }
}

#[derive(Debug, Clone)]
struct AliasInfo {
    target: String,
    confidence: String,
}

#[derive(Default)]
struct Identity {
    aliases: BTreeMap<String, AliasInfo>,
    preferences: serde_json::Map<String, Value>,
    goals: Vec<Value>,
    profile_data: serde_json::Map<String, Value>,
    injuries: Vec<Value>,
    exercises_logged: HashSet<String>,
    raw_exercises_without_id: HashSet<String>,
    exercise_occurrences: HashMap<String, u64>,
    total_events: u64,
    total_set_logged: u64,
    events_without_exercise_id: u64,
    set_logged_range: Option<(String, String)>,
}

/// One pass over the surviving event tail, mirroring the identity +
/// data-quality extraction every dimension handler performs, but scoped to
/// the fields the three-layer envelope actually surfaces.
fn scan_identity(events: &[Event]) -> Identity {
    let mut identity = Identity::default();
    let mut first_set_date: Option<String> = None;
    let mut last_set_date: Option<String> = None;

    for event in events {
        identity.total_events += 1;
        match event.event_type.as_str() {
            "set.logged" => {
                identity.total_set_logged += 1;
                let date = event.timestamp.date_naive().to_string();
                if first_set_date.is_none() {
                    first_set_date = Some(date.clone());
                }
                last_set_date = Some(date);

                let exercise_id = event.data.get_str("exercise_id").unwrap_or("").trim().to_lowercase();
                let exercise = event.data.get_str("exercise").unwrap_or("").trim().to_lowercase();
                let key = if !exercise_id.is_empty() { exercise_id.clone() } else { exercise };
                if !key.is_empty() {
                    identity.exercises_logged.insert(key.clone());
                }
                if exercise_id.is_empty() {
                    identity.events_without_exercise_id += 1;
                    if !key.is_empty() {
                        identity.raw_exercises_without_id.insert(key.clone());
                        *identity.exercise_occurrences.entry(key).or_insert(0) += 1;
                    }
                }
            }
            "exercise.alias_created" => {
                let alias = event.data.get_str("alias").unwrap_or("").trim().to_string();
                let target = event.data.get_str("exercise_id").unwrap_or("").trim().to_lowercase();
                let confidence = event.data.get_str("confidence").unwrap_or("confirmed").to_string();
                if !alias.is_empty() && !target.is_empty() {
                    identity.aliases.insert(alias, AliasInfo { target, confidence });
                }
            }
            "preference.set" => {
                let key = event.data.get_str("key").unwrap_or("").to_string();
                if !key.is_empty() {
                    if let Some(value) = event.data.get("value") {
                        identity.preferences.insert(key, value.clone());
                    }
                }
            }
            "goal.set" => identity.goals.push(event.data.as_value().clone()),
            "profile.updated" => {
                for (k, v) in event.data.as_map() {
                    identity.profile_data.insert(k.clone(), v.clone());
                }
            }
            "injury.reported" => identity.injuries.push(event.data.as_value().clone()),
            _ => {}
        }
    }

    if let (Some(from), Some(to)) = (first_set_date, last_set_date) {
        identity.set_logged_range = Some((from, to));
    }
    identity
}

fn find_orphaned_event_types(registry: &Registry, event_type_counts: &HashMap<String, u64>) -> Vec<Value> {
    let mut orphaned: Vec<(String, u64)> = event_type_counts.iter().filter(|(event_type, _)| registry.is_orphaned(event_type)).map(|(k, v)| (k.clone(), *v)).collect();
    orphaned.sort_by(|a, b| a.0.cmp(&b.0));
    orphaned.into_iter().map(|(event_type, count)| json!({"event_type": event_type, "count": count})).collect()
}

fn compute_interview_coverage(identity: &Identity) -> Vec<Value> {
    let has_modality = identity.profile_data.get("training_modality").is_some_and(|v| !v.is_null());
    let has_experience = identity.profile_data.get("experience_level").is_some_and(|v| !v.is_null());
    let alias_count = identity.aliases.len();

    COVERAGE_AREAS
        .iter()
        .map(|area| match *area {
            "training_background" => covered_if(area, has_modality || has_experience),
            "goals" => covered_if(area, !identity.goals.is_empty()),
            "exercise_vocabulary" => {
                if alias_count >= 3 {
                    json!({"area": area, "status": "covered"})
                } else if alias_count > 0 {
                    json!({"area": area, "status": "needs_depth", "note": format!("{alias_count} aliases, suggest more")})
                } else {
                    json!({"area": area, "status": "uncovered"})
                }
            }
            "unit_preferences" => covered_if(area, identity.preferences.contains_key("unit_system")),
            "injuries" => covered_if(area, !identity.injuries.is_empty() || identity.profile_data.get("injuries_none").and_then(Value::as_bool).unwrap_or(false)),
            "equipment" => covered_if(area, identity.profile_data.get("available_equipment").is_some_and(|v| !v.is_null())),
            "schedule" => covered_if(area, identity.profile_data.get("training_frequency_per_week").is_some_and(|v| !v.is_null())),
            "nutrition_interest" => covered_if(area, identity.preferences.contains_key("nutrition_tracking")),
            "current_program" => covered_if(area, identity.profile_data.get("current_program").is_some_and(|v| !v.is_null())),
            other => json!({"area": other, "status": "uncovered"}),
        })
        .collect()
}

fn covered_if(area: &str, condition: bool) -> Value {
    json!({"area": area, "status": if condition { "covered" } else { "uncovered" }})
}

fn should_suggest_onboarding(total_events: u64, coverage: &[Value]) -> bool {
    if total_events >= 5 {
        return false;
    }
    coverage.iter().filter(|c| c["status"] == "uncovered").count() >= 5
}

fn should_suggest_refresh(total_events: u64, coverage: &[Value], has_goals: bool, has_preferences: bool) -> bool {
    if total_events <= 20 {
        return false;
    }
    let uncovered = coverage.iter().filter(|c| c["status"] == "uncovered").count();
    uncovered >= 3 && (!has_goals || !has_preferences)
}

fn build_agenda(unresolved: &[Value], unconfirmed_aliases: &[(String, AliasInfo)], coverage: &[Value], total_events: u64, has_goals: bool, has_preferences: bool) -> Vec<Value> {
    let mut agenda = Vec::new();

    if should_suggest_onboarding(total_events, coverage) {
        agenda.push(json!({
            "priority": "high",
            "type": "onboarding_needed",
            "detail": "New user with minimal data. Interview recommended to bootstrap profile.",
            "dimensions": ["user_profile"],
        }));
    } else if should_suggest_refresh(total_events, coverage, has_goals, has_preferences) {
        let uncovered: Vec<&str> = coverage.iter().filter(|c| c["status"] == "uncovered").filter_map(|c| c["area"].as_str()).collect();
        agenda.push(json!({
            "priority": "medium",
            "type": "profile_refresh_suggested",
            "detail": format!("Missing context in {} areas: {}. Brief interview would improve analysis.", uncovered.len(), uncovered.iter().take(3).cloned().collect::<Vec<_>>().join(", ")),
            "dimensions": ["user_profile"],
        }));
    }

    if !unresolved.is_empty() {
        let total: u64 = unresolved.iter().filter_map(|u| u["occurrences"].as_u64()).sum();
        let exercises: Vec<&str> = unresolved.iter().filter_map(|u| u["exercise"].as_str()).collect();
        let detail = if exercises.len() == 1 {
            format!("{total} sets logged as '{}' — suggest canonical name", exercises[0])
        } else {
            format!("{total} sets across {} unresolved exercises — suggest canonical names", exercises.len())
        };
        agenda.push(json!({"priority": "medium", "type": "resolve_exercises", "detail": detail, "dimensions": ["user_profile"]}));
    }

    for (alias, info) in unconfirmed_aliases {
        agenda.push(json!({
            "priority": "low",
            "type": "confirm_alias",
            "detail": format!("Alias '{alias}' → {} is {}, not confirmed", info.target, info.confidence),
            "dimensions": ["user_profile"],
        }));
    }

    agenda
}

fn build_data_quality(total_set_logged: u64, events_without_exercise_id: u64, unresolved_exercises: &[String], occurrences: &HashMap<String, u64>, unconfirmed_aliases: &[(String, AliasInfo)], orphaned_event_types: &[Value]) -> Value {
    let mut actionable = Vec::new();
    for ex in unresolved_exercises {
        actionable.push(json!({"type": "unresolved_exercise", "exercise": ex, "occurrences": occurrences.get(ex).copied().unwrap_or(0)}));
    }
    for (alias, info) in unconfirmed_aliases {
        actionable.push(json!({"type": "unconfirmed_alias", "alias": alias, "target": info.target, "confidence": info.confidence}));
    }
    json!({
        "total_set_logged_events": total_set_logged,
        "events_without_exercise_id": events_without_exercise_id,
        "actionable": actionable,
        "orphaned_event_types": orphaned_event_types,
    })
}

/// Per-dimension status merging the registry declaration with observed
/// projection rows: `no_data`, or `active` with freshness, the
/// `set.logged` coverage window, and the handler's `manifest_contribution`.
async fn build_user_dimensions(ctx: &HandlerContext, registry: &Registry, user_id: kura_core::UserId, set_logged_range: &Option<(String, String)>) -> Value {
    let mut dimensions = serde_json::Map::new();
    for (name, _meta) in registry.dimension_metadata() {
        if *name == DIMENSION {
            continue;
        }
        let rows = match ctx.projections.list_by_type(user_id, name).await {
            Ok(rows) => rows,
            Err(_) => Vec::new(),
        };
        if rows.is_empty() {
            dimensions.insert((*name).to_string(), json!({"status": "no_data"}));
            continue;
        }

        let freshness = rows.iter().map(|r| r.updated_at).max();
        let mut entry = serde_json::Map::new();
        entry.insert("status".to_string(), json!("active"));
        if let Some(freshness) = freshness {
            entry.insert("freshness".to_string(), json!(freshness.to_rfc3339()));
        }
        if let Some((from, to)) = set_logged_range {
            entry.insert("coverage".to_string(), json!({"from": from, "to": to}));
        }

        if let Some(handler) = registry.handler_for_dimension(name) {
            let rows_payload = json!({"rows": rows.iter().map(|r| json!({"key": r.key, "data": r.data.as_value()})).collect::<Vec<_>>()});
            let contribution = handler.manifest_contribution(&Payload::new(rows_payload));
            if let Value::Object(summary) = contribution {
                for (k, v) in summary {
                    entry.insert(k, v);
                }
            }
        }

        dimensions.insert((*name).to_string(), Value::Object(entry));
    }
    Value::Object(dimensions)
}

/// Static capabilities layer: dimension descriptions from the registry, the
/// event-type catalog, exercise-normalization conventions, and the
/// onboarding interview guide — identical for every user.
fn build_system_layer(registry: &Registry) -> Value {
    let mut dimensions = serde_json::Map::new();
    for (name, meta) in registry.dimension_metadata() {
        dimensions.insert(
            (*name).to_string(),
            json!({
                "description": meta.description,
                "key_structure": meta.key_shape,
                "granularity": meta.granularity_tags,
                "relates_to": meta.related_dimensions,
                "context_seeds": meta.context_seeds,
                "output_schema": meta.output_schema,
            }),
        );
    }

    json!({
        "dimensions": dimensions,
        "event_conventions": event_conventions(),
        "conventions": {
            "exercise_normalization": {
                "rules": [
                    "Always set exercise_id when the exercise is recognized.",
                    "When setting exercise + exercise_id for a user term the first time, also emit exercise.alias_created in the same batch.",
                    "When uncertain about the canonical name, ask the user.",
                    "Only omit exercise_id when the exercise is genuinely unknown.",
                    "Check user.aliases for an existing mapping before creating a new one.",
                ],
                "example_batch": [
                    {"event_type": "set.logged", "data": {"exercise": "back squat", "exercise_id": "barbell_back_squat", "weight_kg": 100, "reps": 5}},
                    {"event_type": "exercise.alias_created", "data": {"alias": "back squat", "exercise_id": "barbell_back_squat", "confidence": "confirmed"}},
                ],
            },
        },
        "time_conventions": {
            "week": "ISO 8601 (2026-W06)",
            "date": "ISO 8601 (2026-02-08)",
            "timestamp": "ISO 8601 with timezone",
        },
        "interview_guide": interview_guide(),
    })
}

fn event_conventions() -> Value {
    json!({
        "profile.updated": {"description": "User attributes, delta merge (latest per field wins).", "fields": ["experience_level", "training_modality", "training_frequency_per_week", "available_equipment", "current_program", "age", "bodyweight_kg"]},
        "goal.set": {"description": "A tracked goal; jump/dunk goals need an explicit tracking path (baseline + target)."},
        "preference.set": {"description": "key/value preference, e.g. timezone, unit_system, nutrition_tracking."},
        "set.logged": {"description": "A single training set.", "fields": ["exercise_id", "exercise", "weight_kg", "reps"]},
        "exercise.alias_created": {"description": "Maps a user term to a canonical exercise_id.", "fields": ["alias", "exercise_id", "confidence"]},
        "injury.reported": {"description": "A reported injury or limitation."},
        "bodyweight.logged": {"description": "A bodyweight measurement in kg."},
        "measurement.logged": {"description": "A body-composition measurement (skinfold, circumference, etc.)."},
        "sleep.logged": {"description": "Nightly sleep duration and quality signals."},
        "soreness.logged": {"description": "Subjective soreness severity."},
        "energy.logged": {"description": "Subjective energy level."},
        "meal.logged": {"description": "A logged meal with macro fields."},
        "training_plan.created": {"description": "A new training plan."},
        "training_plan.updated": {"description": "A delta update to the active training plan."},
        "training_plan.archived": {"description": "Retires a training plan."},
        "nutrition_target.set": {"description": "A nutrition target (calories/macros)."},
        "sleep_target.set": {"description": "A sleep duration target."},
        "weight_target.set": {"description": "A bodyweight target."},
        "projection_rule.created": {"description": "Declares a custom field_tracking or categorized_tracking rule."},
        "projection_rule.archived": {"description": "Retires a custom projection rule."},
    })
}

fn interview_guide() -> Value {
    json!({
        "coverage_areas": COVERAGE_AREAS,
        "guidance": "Cover each area opportunistically across the conversation rather than as a single interrogation; re-check uncovered areas when the agenda suggests onboarding or a profile refresh.",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::{EventId, UserId};

    fn event(event_type: &str, data: Value) -> Event {
        Event { event_id: EventId::new(), user_id: UserId::new(), timestamp: Utc::now(), event_type: event_type.to_string(), data: Payload::new(data), metadata: Payload::empty() }
    }

    #[test]
    fn unresolved_exercise_without_alias_is_flagged() {
        let events = vec![event("set.logged", json!({"exercise": "mystery lift", "weight_kg": 60, "reps": 5}))];
        let identity = scan_identity(&events);
        assert!(identity.raw_exercises_without_id.contains("mystery lift"));
    }

    #[test]
    fn unconfirmed_alias_is_not_confirmed() {
        let events = vec![event("exercise.alias_created", json!({"alias": "back squat", "exercise_id": "barbell_back_squat", "confidence": "tentative"}))];
        let identity = scan_identity(&events);
        assert_eq!(identity.aliases["back squat"].confidence, "tentative");
    }

    #[test]
    fn onboarding_suggested_for_sparse_new_user() {
        let coverage: Vec<Value> = COVERAGE_AREAS.iter().map(|a| json!({"area": a, "status": "uncovered"})).collect();
        assert!(should_suggest_onboarding(2, &coverage));
        assert!(!should_suggest_onboarding(10, &coverage));
    }

    #[test]
    fn refresh_suggested_only_past_threshold() {
        let coverage: Vec<Value> = COVERAGE_AREAS.iter().map(|a| json!({"area": a, "status": "uncovered"})).collect();
        assert!(!should_suggest_refresh(10, &coverage, true, true));
        assert!(should_suggest_refresh(25, &coverage, false, false));
    }
}
