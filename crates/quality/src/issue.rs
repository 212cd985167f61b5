//! Read-only invariant evaluation (spec §4.6.1).
//!
//! Every invariant in this table is detection-only; only INV-001 and
//! INV-003 feed the proposal generator (`proposal.rs`) — the rest exist so
//! the quality score and SLOs reflect the full picture even where no
//! automated repair is offered yet.

use std::collections::{HashMap, HashSet};

use kura_corrections::{apply_set_correction_chain, classify_import_error_code, is_import_parse_quality_failure, AliasMap, CorrectedSet, ImportErrorClass};
use kura_events::Event;
use serde_json::{json, Map, Value};

use crate::mention_fields::{evaluate_set_context_rows, MentionRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    /// Score penalty weight (spec §4.6's quality score; high=0.25/medium=0.12/low=0.05).
    pub fn score_weight(&self) -> f64 {
        match self {
            Self::High => 0.25,
            Self::Medium => 0.12,
            Self::Low => 0.05,
            Self::Info => 0.0,
        }
    }

    /// Ascending sort rank matching the original's severity-first ordering
    /// (high sorts before medium sorts before low).
    fn sort_rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
            Self::Info => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub issue_id: String,
    pub invariant_id: &'static str,
    pub issue_type: &'static str,
    pub severity: Severity,
    pub detail: String,
    pub metrics: Value,
}

fn issue(invariant_id: &'static str, issue_type: &'static str, severity: Severity, detail: impl Into<String>, metrics: Value) -> Issue {
    Issue {
        issue_id: format!("{invariant_id}:{issue_type}"),
        invariant_id,
        issue_type,
        severity,
        detail: detail.into(),
        metrics,
    }
}

/// Stable ordering used both for display (`top_issues`) and for determining
/// which proposal claims an `issue_id` first (spec §4.6.1).
pub fn sort_issues(mut issues: Vec<Issue>) -> Vec<Issue> {
    issues.sort_by(|a, b| {
        a.severity
            .sort_rank()
            .cmp(&b.severity.sort_rank())
            .then_with(|| a.invariant_id.cmp(b.invariant_id))
            .then_with(|| a.issue_type.cmp(b.issue_type))
    });
    issues
}

/// Trimmed, lowercased string coercion matching `kura_core::Payload`'s
/// normalization rules, for the plain `serde_json::Map` values this module
/// works with directly (correction overlay output, raw event data).
fn normalize_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_lowercase(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn normalized_field(map: &Map<String, Value>, key: &str) -> String {
    normalize_value(map.get(key))
}

fn to_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub struct InvariantInputs<'a> {
    pub events: &'a [Event],
    pub alias_map: &'a AliasMap,
}

/// Evaluate every read-only invariant against one user's event history and
/// return the open issues plus the flat metrics bag the SLO/score stages
/// consume (spec §4.6.1, §4.6.7).
pub fn evaluate_invariants(inputs: &InvariantInputs<'_>) -> (Vec<Issue>, Value) {
    let events = inputs.events;
    let mut issues = Vec::new();

    let raw_set_rows: Vec<Event> = events.iter().filter(|e| e.event_type == "set.logged").cloned().collect();
    let correction_rows: Vec<Event> = events.iter().filter(|e| e.event_type == "set.corrected").cloned().collect();
    let corrected = apply_set_correction_chain(raw_set_rows, &correction_rows);

    let total_set_logged = corrected.len();
    let mut unresolved_terms: HashMap<String, usize> = HashMap::new();
    for row in &corrected {
        let exercise_id = normalized_field(&row.effective_data, "exercise_id");
        if !exercise_id.is_empty() {
            continue;
        }
        let exercise = normalized_field(&row.effective_data, "exercise");
        if exercise.is_empty() {
            *unresolved_terms.entry("<missing_exercise>".to_string()).or_insert(0) += 1;
            continue;
        }
        if inputs.alias_map.resolve(&exercise).is_some() {
            continue;
        }
        *unresolved_terms.entry(exercise).or_insert(0) += 1;
    }
    let unresolved_set_logged: usize = unresolved_terms.values().sum();
    let unresolved_pct = if total_set_logged > 0 {
        round2((unresolved_set_logged as f64 / total_set_logged as f64) * 100.0)
    } else {
        0.0
    };

    if unresolved_set_logged > 0 {
        let mut by_count: Vec<(&String, &usize)> = unresolved_terms.iter().collect();
        by_count.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top_terms_with_counts: Vec<Value> = by_count
            .iter()
            .take(5)
            .map(|(term, count)| json!({"term": term, "count": count}))
            .collect();
        issues.push(issue(
            "INV-001",
            "unresolved_exercise_identity",
            Severity::High,
            format!("{unresolved_set_logged}/{total_set_logged} set.logged events lack canonical exercise identity resolution."),
            json!({
                "total_set_logged": total_set_logged,
                "unresolved_set_logged": unresolved_set_logged,
                "unresolved_pct": unresolved_pct,
                "top_unresolved_terms_with_counts": top_terms_with_counts,
            }),
        ));
    }

    let mut timezone_pref: Option<String> = None;
    let mut profile: Map<String, Value> = Map::new();
    for row in events {
        if row.event_type == "preference.set" {
            let key = row.data.normalized_str("key");
            if key == "timezone" || key == "time_zone" {
                timezone_pref = row.data.get("value").map(|v| normalize_value(Some(v)));
            }
        }
        if row.event_type == "profile.updated" {
            for (k, v) in row.data.as_map() {
                profile.insert(k.clone(), v.clone());
            }
        }
    }
    let timezone_configured = timezone_pref.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    if !timezone_configured {
        issues.push(issue(
            "INV-003",
            "timezone_missing",
            Severity::High,
            "No explicit timezone preference found; date/week interpretations may drift.",
            json!({}),
        ));
    }

    const PLANNING_EVENT_TYPES: &[&str] = &[
        "training_plan.created",
        "training_plan.updated",
        "training_plan.archived",
        "projection_rule.created",
        "projection_rule.archived",
        "weight_target.set",
        "sleep_target.set",
        "nutrition_target.set",
    ];
    let planning_rows: Vec<&Event> = events.iter().filter(|e| PLANNING_EVENT_TYPES.contains(&e.event_type.as_str())).collect();
    let onboarding_closed = events.iter().any(|e| e.event_type == "workflow.onboarding.closed");
    let onboarding_override = events.iter().any(|e| e.event_type == "workflow.onboarding.override_granted");
    if !planning_rows.is_empty() && !onboarding_closed && !onboarding_override {
        issues.push(issue(
            "INV-004",
            "onboarding_phase_violation",
            Severity::Medium,
            "Planning/coaching events were recorded before onboarding close without explicit override.",
            json!({"planning_event_count": planning_rows.len()}),
        ));
    }

    let has_age = profile.get("age").map(|v| !v.is_null()).unwrap_or(false) || profile.get("date_of_birth").map(|v| !v.is_null()).unwrap_or(false);
    let age_deferred = profile.get("age_deferred").and_then(Value::as_bool).unwrap_or(false)
        || profile.get("date_of_birth_deferred").and_then(Value::as_bool).unwrap_or(false);
    if !has_age && !age_deferred {
        issues.push(issue("INV-006", "baseline_age_unknown", Severity::Medium, "Age baseline missing and not explicitly deferred.", json!({})));
    }

    let has_bodyweight_profile = profile.get("bodyweight_kg").map(|v| !v.is_null()).unwrap_or(false);
    let has_bodyweight_events = events
        .iter()
        .any(|e| e.event_type == "bodyweight.logged" && e.data.get_f64("weight_kg").is_some());
    let bodyweight_deferred = profile.get("bodyweight_deferred").and_then(Value::as_bool).unwrap_or(false)
        || profile.get("body_composition_deferred").and_then(Value::as_bool).unwrap_or(false);
    if !(has_bodyweight_profile || has_bodyweight_events || bodyweight_deferred) {
        issues.push(issue("INV-006", "baseline_bodyweight_unknown", Severity::Medium, "Bodyweight baseline missing and not explicitly deferred.", json!({})));
    }

    let goal_rows: Vec<&Event> = events.iter().filter(|e| e.event_type == "goal.set").collect();
    let jump_goals: Vec<&&Event> = goal_rows.iter().filter(|r| has_jump_goal(r)).collect();
    if !jump_goals.is_empty() && !has_jump_tracking_path(&corrected, events) {
        issues.push(issue(
            "INV-005",
            "goal_trackability_missing",
            Severity::Medium,
            "Jump/Dunk goal detected without an observable tracking path.",
            json!({"jump_goal_count": jump_goals.len()}),
        ));
    }

    // INV-008: mention-field drift. Each set.logged row's correction-resolved
    // data is replayed through the scope-carried-defaults evaluator; a field
    // defaulted from a mention but never persisted structurally is drift.
    let mention_rows: Vec<MentionRow> =
        corrected.iter().map(|row| MentionRow { effective_data: &row.effective_data, metadata: row.event.metadata.as_map(), timestamp: row.event.timestamp }).collect();
    let mention_evaluations = evaluate_set_context_rows(&mention_rows);
    let mut mention_drift_total = 0usize;
    let mut mention_drift_by_field: HashMap<&'static str, usize> = HashMap::new();
    let mut mention_drift_hints: Vec<String> = Vec::new();
    for evaluation in &mention_evaluations {
        for field in &evaluation.missing_fields {
            mention_drift_total += 1;
            *mention_drift_by_field.entry(*field).or_insert(0) += 1;
        }
        for hint in &evaluation.hint_messages {
            if mention_drift_hints.len() < 5 && !mention_drift_hints.contains(hint) {
                mention_drift_hints.push(hint.clone());
            }
        }
    }
    if mention_drift_total > 0 {
        issues.push(issue(
            "INV-008",
            "mention_field_drift",
            Severity::Medium,
            format!("{mention_drift_total} set-context fields were captured via mention/default but never persisted structurally."),
            json!({
                "mention_drift_total": mention_drift_total,
                "mention_drift_by_field": mention_drift_by_field,
                "sample_hints": mention_drift_hints,
            }),
        ));
    }

    // INV-010: session missing anchor. Every performance block (all block
    // types except recovery_session) needs an intensity anchor or an
    // explicit not_applicable waiver (training-session contract's
    // performance-block anchor policy).
    let session_logged_rows: Vec<&Event> = events.iter().filter(|e| e.event_type == "session.logged").collect();
    let mut missing_anchor_block_total = 0usize;
    let mut sessions_with_anchor_gap: HashSet<String> = HashSet::new();
    for row in &session_logged_rows {
        let Some(blocks) = row.data.get_array("blocks") else { continue };
        for block in blocks {
            let Some(block) = block.as_object() else { continue };
            let block_type = normalize_value(block.get("block_type"));
            if block_type.is_empty() || block_type == "recovery_session" {
                continue;
            }
            let has_anchor = block.get("intensity_anchors").and_then(Value::as_array).map(|a| !a.is_empty()).unwrap_or(false);
            let explicit_waiver = block.get("intensity_anchors_status").and_then(Value::as_str).is_some_and(|s| s == "not_applicable");
            if !has_anchor && !explicit_waiver {
                missing_anchor_block_total += 1;
                sessions_with_anchor_gap.insert(row.event_id.to_string());
            }
        }
    }
    if missing_anchor_block_total > 0 {
        issues.push(issue(
            "INV-010",
            "session_missing_anchor",
            Severity::Medium,
            format!(
                "{missing_anchor_block_total} performance blocks across {} sessions lack an intensity anchor or explicit not_applicable waiver.",
                sessions_with_anchor_gap.len()
            ),
            json!({
                "missing_anchor_block_total": missing_anchor_block_total,
                "sessions_with_anchor_gap_total": sessions_with_anchor_gap.len(),
            }),
        ));
    }

    // INV-009: external import quality — unsupported fields, low-confidence
    // mappings, and temporal uncertainty come directly from
    // `external.activity_imported` provenance; dedup rejections and
    // parse-quality failures are classified from each reported import
    // error's `code` via the import worker's stable error taxonomy.
    let external_rows: Vec<&Event> = events.iter().filter(|e| e.event_type == "external.activity_imported").collect();
    let mut unsupported_fields_total = 0usize;
    let mut low_confidence_fields = 0usize;
    let mut temporal_uncertainty_total = 0usize;
    let mut dedup_rejection_total = 0usize;
    let mut parse_failure_total = 0usize;
    for row in &external_rows {
        let Some(provenance) = row.data.get_object("provenance") else { continue };
        if let Some(Value::Array(items)) = provenance.get("unsupported_fields") {
            unsupported_fields_total += items.iter().filter(|v| v.as_str().is_some_and(|s| !s.trim().is_empty())).count();
        }
        if let Some(Value::Array(warnings)) = provenance.get("warnings") {
            temporal_uncertainty_total += warnings
                .iter()
                .filter(|w| w.as_str().is_some_and(|s| s.to_lowercase().contains("timezone") || s.to_lowercase().contains("drift")))
                .count();
        }
        if let Some(Value::Object(field_provenance)) = provenance.get("field_provenance") {
            for entry in field_provenance.values() {
                let Some(entry) = entry.as_object() else { continue };
                let confidence = to_f64(entry.get("confidence")).unwrap_or(1.0);
                let status = entry.get("status").and_then(Value::as_str).unwrap_or("mapped").to_lowercase();
                if status != "mapped" || confidence < 0.86 {
                    low_confidence_fields += 1;
                }
            }
        }
        if let Some(Value::Array(import_errors)) = provenance.get("import_errors") {
            for entry in import_errors {
                let code = entry.as_object().and_then(|o| o.get("code")).and_then(Value::as_str);
                if classify_import_error_code(code) == ImportErrorClass::Dedup {
                    dedup_rejection_total += 1;
                } else if is_import_parse_quality_failure(code) {
                    parse_failure_total += 1;
                }
            }
        }
    }
    if unsupported_fields_total > 0 {
        issues.push(issue(
            "INV-009",
            "external_unsupported_fields",
            Severity::Medium,
            format!("External imports contain {unsupported_fields_total} unsupported source fields that are excluded from canonical certainty."),
            json!({"unsupported_fields_total": unsupported_fields_total}),
        ));
    }
    if low_confidence_fields > 0 {
        issues.push(issue(
            "INV-009",
            "external_low_confidence_fields",
            Severity::Medium,
            format!("{low_confidence_fields} external mapped fields are low-confidence or explicitly non-mapped."),
            json!({"external_low_confidence_fields": low_confidence_fields}),
        ));
    }
    if temporal_uncertainty_total > 0 {
        issues.push(issue(
            "INV-009",
            "external_temporal_uncertainty",
            Severity::Low,
            format!("External imports reported {temporal_uncertainty_total} temporal uncertainty hints (timezone/drift)."),
            json!({"external_temporal_uncertainty_total": temporal_uncertainty_total}),
        ));
    }
    if dedup_rejection_total > 0 {
        issues.push(issue(
            "INV-009",
            "external_dedup_rejections",
            Severity::Low,
            format!("{dedup_rejection_total} external import rows were rejected as stale or conflicting duplicates."),
            json!({"external_dedup_rejections_total": dedup_rejection_total}),
        ));
    }
    if parse_failure_total > 0 {
        issues.push(issue(
            "INV-009",
            "external_parse_failures",
            Severity::Medium,
            format!("{parse_failure_total} external import rows failed parse, mapping, or validation quality checks."),
            json!({"external_parse_failures_total": parse_failure_total}),
        ));
    }

    let metrics = json!({
        "total_events": events.len(),
        "set_logged_total": total_set_logged,
        "set_logged_unresolved": unresolved_set_logged,
        "set_logged_unresolved_pct": unresolved_pct,
        "goal_total": goal_rows.len(),
        "timezone_configured": timezone_configured,
        "onboarding_closed": onboarding_closed,
        "onboarding_override_present": onboarding_override,
        "planning_event_total": planning_rows.len(),
        "external_imported_total": external_rows.len(),
        "external_unsupported_fields_total": unsupported_fields_total,
        "external_low_confidence_fields": low_confidence_fields,
        "external_temporal_uncertainty_total": temporal_uncertainty_total,
        "external_dedup_rejections_total": dedup_rejection_total,
        "external_parse_failures_total": parse_failure_total,
        "mention_drift_total": mention_drift_total,
        "session_logged_total": session_logged_rows.len(),
        "missing_anchor_block_total": missing_anchor_block_total,
    });

    (sort_issues(issues), metrics)
}

fn has_jump_goal(row: &Event) -> bool {
    let goal_type = row.data.normalized_str("goal_type");
    if goal_type.contains("jump") || goal_type.contains("dunk") {
        return true;
    }
    let description = row.data.normalized_str("description");
    ["dunk", "springen", "jump", "cmj"].iter().any(|term| description.contains(term))
}

fn has_jump_tracking_path(corrected: &[CorrectedSet], events: &[Event]) -> bool {
    const JUMP_EXERCISE_IDS: &[&str] = &["countermovement_jump", "box_jump", "jump_squat"];
    for row in corrected {
        let exercise_id = normalized_field(&row.effective_data, "exercise_id");
        let exercise = normalized_field(&row.effective_data, "exercise");
        if JUMP_EXERCISE_IDS.contains(&exercise_id.as_str()) {
            return true;
        }
        if ["jump", "cmj", "sprung"].iter().any(|t| exercise.contains(t)) {
            return true;
        }
    }
    let mut active_rules: std::collections::HashSet<String> = std::collections::HashSet::new();
    for row in events {
        if row.event_type == "projection_rule.created" {
            let name = row.data.normalized_str("name");
            if !name.is_empty() {
                active_rules.insert(name);
            }
        } else if row.event_type == "projection_rule.archived" {
            let name = row.data.normalized_str("name");
            active_rules.remove(&name);
        }
    }
    active_rules.iter().any(|name| name.contains("jump"))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::{Payload, UserId};
    use serde_json::json;

    fn event(user: UserId, event_type: &str, data: Value) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: user,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data: Payload::new(data),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn unresolved_exercise_term_raises_inv001() {
        let user = UserId::new();
        let events = vec![event(user, "set.logged", json!({"exercise": "unknown lift", "reps": 5}))];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(issues.iter().any(|i| i.issue_type == "unresolved_exercise_identity"));
    }

    #[test]
    fn missing_timezone_raises_inv003() {
        let user = UserId::new();
        let events = vec![event(user, "set.logged", json!({"exercise_id": "barbell_back_squat"}))];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(issues.iter().any(|i| i.issue_type == "timezone_missing"));
    }

    #[test]
    fn explicit_timezone_preference_clears_inv003() {
        let user = UserId::new();
        let events = vec![event(user, "preference.set", json!({"key": "timezone", "value": "Europe/Berlin"}))];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(!issues.iter().any(|i| i.issue_type == "timezone_missing"));
    }

    #[test]
    fn mention_defaulted_field_never_persisted_raises_inv008() {
        let user = UserId::new();
        let events = vec![
            event(user, "set.logged", json!({"exercise_id": "barbell_back_squat", "notes": "pause 90 sec"})),
            event(user, "set.logged", json!({"exercise_id": "barbell_back_squat"})),
        ];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(issues.iter().any(|i| i.issue_type == "mention_field_drift"));
    }

    #[test]
    fn performance_block_without_anchor_or_waiver_raises_inv010() {
        let user = UserId::new();
        let events = vec![event(
            user,
            "session.logged",
            json!({"blocks": [{"block_type": "strength_set", "dose": {"work": {"reps": 5}}}]}),
        )];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(issues.iter().any(|i| i.issue_type == "session_missing_anchor"));
    }

    #[test]
    fn explicit_not_applicable_waiver_clears_inv010() {
        let user = UserId::new();
        let events = vec![event(
            user,
            "session.logged",
            json!({"blocks": [{"block_type": "strength_set", "intensity_anchors_status": "not_applicable", "dose": {"work": {"reps": 5}}}]}),
        )];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(!issues.iter().any(|i| i.issue_type == "session_missing_anchor"));
    }

    #[test]
    fn recovery_session_block_never_requires_anchor() {
        let user = UserId::new();
        let events = vec![event(user, "session.logged", json!({"blocks": [{"block_type": "recovery_session", "dose": {"work": {"duration_seconds": 600}}}]}))];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        assert!(!issues.iter().any(|i| i.issue_type == "session_missing_anchor"));
    }

    #[test]
    fn dedup_import_errors_raise_low_severity_inv009() {
        let user = UserId::new();
        let events = vec![event(
            user,
            "external.activity_imported",
            json!({"provenance": {"import_errors": [{"code": "stale_version"}]}}),
        )];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        let found = issues.iter().find(|i| i.issue_type == "external_dedup_rejections").expect("dedup issue");
        assert_eq!(found.severity, Severity::Low);
    }

    #[test]
    fn parse_error_import_errors_raise_medium_severity_inv009() {
        let user = UserId::new();
        let events = vec![event(
            user,
            "external.activity_imported",
            json!({"provenance": {"import_errors": [{"code": "validation_error"}]}}),
        )];
        let alias_map = AliasMap::build(&[]);
        let (issues, _metrics) = evaluate_invariants(&InvariantInputs { events: &events, alias_map: &alias_map });
        let found = issues.iter().find(|i| i.issue_type == "external_parse_failures").expect("parse failure issue");
        assert_eq!(found.severity, Severity::Medium);
    }
}
