//! Mention-bound set-context field drift detection (INV-008, spec §4.6.1).
//!
//! Some set fields — rest time, tempo, RIR, set type — are captured in
//! free-text mentions (notes, voice transcripts, coaching chat) as often as
//! in structured fields. When a session/exercise scope carries a mentioned
//! value forward as an implicit default but a later row in that scope never
//! persists the field structurally, the value has drifted into text
//! without making it into the canonical record. Ported from the import
//! worker's core-field registry and mention extractor.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Strength,
    Hypertrophy,
    Oly,
}

impl Modality {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "hypertrophy" => Self::Hypertrophy,
            "oly" => Self::Oly,
            _ => Self::Strength,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strength => "strength",
            Self::Hypertrophy => "hypertrophy",
            Self::Oly => "oly",
        }
    }

    /// Fields that are as often captured by mention as by structured input.
    /// Oly lifts skip RIR — it isn't part of the lift's technical model.
    fn mention_bound_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Strength | Self::Hypertrophy => &["rest_seconds", "tempo", "rir", "set_type"],
            Self::Oly => &["rest_seconds", "tempo", "set_type"],
        }
    }
}

const REST_WORD: &str = r"(?:rest|pause|break|satzpause|repos|r[eé]cup(?:[eé]ration)?|descanso|pausa|riposo|отдых|пауза|pauze|rust|przerwa|vila|paus|dinlenme|ara)";
const UNIT_SECONDS: &str = r"(?:seconds?|secondes?|secondi|secondo|seconden|secs?|sek(?:und[eny]?)?|seg(?:undos?)?|секунд[аы]?|сек|saniye|sn|s)";
const UNIT_MINUTES: &str = r"(?:minutes?|minuten|minutos?|minuti|minuut|minut[ey]?|mins?|мин(?:ут[аы]?)?|dakika|dk|m)";

static TEMPO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\btempo\s*[:=]?\s*(\d-[\dx]-[\dx]-[\dx])\b").unwrap());
static TEMPO_BARE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(\d-[\dx]-[\dx]-[\dx])\b").unwrap());
static RIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:rir\s*[:=]?\s*(\d+(?:\.\d+)?)|(\d+(?:\.\d+)?)\s*rir|(\d+)\s*reps?\s+in\s+reserve)\b").unwrap());
static REST_MMSS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"(?i)\b{REST_WORD}\s*[:=]?\s*(\d{{1,2}}):(\d{{2}})\b")).unwrap());
static REST_SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{REST_WORD}\s*[:=]?\s*(\d{{1,3}})\s*{UNIT_SECONDS}|(\d{{1,3}})\s*{UNIT_SECONDS}\s*{REST_WORD})\b")).unwrap()
});
static REST_MINUTES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{REST_WORD}\s*[:=]?\s*(\d{{1,2}})\s*{UNIT_MINUTES}|(\d{{1,2}})\s*{UNIT_MINUTES}\s*{REST_WORD})\b")).unwrap()
});
static REST_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"(?i)\b{REST_WORD}\s*[:=]?\s*(\d{{1,3}})\b")).unwrap());

static CJK_SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*[秒초]").unwrap());
static CJK_MINUTES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*[分분]").unwrap());
static COMBINED_PRIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\d{1,2})'(\d{2})(?:''|")"#).unwrap());
static DOUBLE_PRIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(\d{1,3})(?:''|")"#).unwrap());
static SINGLE_PRIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,2})'(?!\d)").unwrap());

const CJK_REST_KEYWORDS: &[&str] = &["休憩", "レスト", "레스트", "휴식", "休息"];

/// Normalize prime notation, CJK units, and international rest keywords so
/// the ASCII-oriented rest-time regexes below can match.
fn preprocess_time_text(text: &str) -> String {
    let mut text = text.to_string();
    for ch in ['\u{2032}', '\u{02B9}', '\u{2018}', '\u{2019}', '\u{02BC}', '\u{00B4}', '`'] {
        text = text.replace(ch, "'");
    }
    for ch in ['\u{2033}', '\u{201C}', '\u{201D}'] {
        text = text.replace(ch, "\"");
    }
    for kw in CJK_REST_KEYWORDS {
        text = text.replace(kw, "rest");
    }
    text = CJK_SECONDS_RE.replace_all(&text, "$1 sec").into_owned();
    text = CJK_MINUTES_RE.replace_all(&text, "$1 min").into_owned();
    text = COMBINED_PRIME_RE.replace_all(&text, "$1:$2").into_owned();
    text = DOUBLE_PRIME_RE.replace_all(&text, "$1 sec").into_owned();
    text = SINGLE_PRIME_RE.replace_all(&text, "$1 min").into_owned();
    text
}

fn normalize_rest_seconds(value: f64) -> Option<f64> {
    if value < 0.0 {
        return None;
    }
    Some((value * 100.0).round() / 100.0)
}

fn normalize_rir(value: f64) -> f64 {
    if value < 0.0 {
        0.0
    } else if value > 10.0 {
        10.0
    } else {
        (value * 100.0).round() / 100.0
    }
}

fn normalize_set_type(value: &str) -> Option<&'static str> {
    let text = value.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    const MAPPING: &[(&str, &str)] = &[("warmup", "warmup"), ("warm-up", "warmup"), ("backoff", "backoff"), ("back-off", "backoff"), ("amrap", "amrap"), ("working", "working")];
    MAPPING.iter().find(|(needle, _)| text.contains(needle)).map(|(_, canonical)| *canonical)
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn extract_rest_seconds(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    let text = preprocess_time_text(text);
    if let Some(caps) = REST_MMSS_RE.captures(&text) {
        let minutes: f64 = caps[1].parse().ok()?;
        let seconds: f64 = caps[2].parse().ok()?;
        return normalize_rest_seconds((minutes * 60.0) + seconds);
    }
    if let Some(caps) = REST_SECONDS_RE.captures(&text) {
        let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
        return normalize_rest_seconds(raw.parse().ok()?);
    }
    if let Some(caps) = REST_MINUTES_RE.captures(&text) {
        let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
        let parsed: f64 = raw.parse().ok()?;
        return normalize_rest_seconds(parsed * 60.0);
    }
    if let Some(caps) = REST_NUMBER_RE.captures(&text) {
        return normalize_rest_seconds(caps[1].parse().ok()?);
    }
    None
}

/// Deterministically map free text mentions to structured set-context fields.
pub fn extract_set_context_mentions(text: &str) -> Map<String, Value> {
    let normalized = text.trim().to_lowercase();
    let mut mentions = Map::new();
    if normalized.is_empty() {
        return mentions;
    }

    if let Some(rest_seconds) = extract_rest_seconds(&normalized) {
        mentions.insert("rest_seconds".to_string(), json!(rest_seconds));
    }

    if let Some(caps) = RIR_RE.captures(&normalized) {
        let raw = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)).map(|m| m.as_str());
        if let Some(value) = raw.and_then(|r| r.parse::<f64>().ok()) {
            mentions.insert("rir".to_string(), json!(normalize_rir(value)));
        }
    }

    let tempo_match = TEMPO_RE.captures(&normalized).or_else(|| TEMPO_BARE_RE.captures(&normalized));
    if let Some(caps) = tempo_match {
        mentions.insert("tempo".to_string(), json!(caps[1].to_lowercase()));
    }

    if let Some(set_type) = normalize_set_type(&normalized) {
        mentions.insert("set_type".to_string(), json!(set_type));
    }

    mentions
}

fn extract_payload_mentions(data: &Map<String, Value>, metadata: &Map<String, Value>) -> Map<String, Value> {
    let mut mentions = Map::new();
    for candidate in [data.get("notes"), data.get("context_text"), data.get("utterance"), metadata.get("source_text"), metadata.get("raw_text"), metadata.get("user_message")] {
        let Some(Value::String(text)) = candidate else { continue };
        if text.trim().is_empty() {
            continue;
        }
        for (key, value) in extract_set_context_mentions(text) {
            mentions.entry(key).or_insert(value);
        }
    }

    // Explicit values in the set payload count as mention-bound capture too.
    if let Some(rest) = data.get("rest_seconds").and_then(to_f64).and_then(normalize_rest_seconds) {
        mentions.insert("rest_seconds".to_string(), json!(rest));
    }
    if let Some(rir) = data.get("rir").and_then(to_f64) {
        mentions.insert("rir".to_string(), json!(normalize_rir(rir)));
    }
    if let Some(Value::String(tempo)) = data.get("tempo") {
        if !tempo.trim().is_empty() {
            mentions.insert("tempo".to_string(), json!(tempo.trim().to_lowercase()));
        }
    }
    if let Some(Value::String(set_type)) = data.get("set_type") {
        if let Some(normalized) = normalize_set_type(set_type) {
            mentions.insert("set_type".to_string(), json!(normalized));
        }
    }

    mentions
}

fn normalized_modality(data: &Map<String, Value>) -> Modality {
    let raw = data.get("modality").or_else(|| data.get("training_modality")).and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
    Modality::from_raw(&raw)
}

fn normalize_exercise_scope(data: &Map<String, Value>) -> String {
    let value = data.get("exercise_id").or_else(|| data.get("exercise")).and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
    if value.is_empty() {
        "*".to_string()
    } else {
        value
    }
}

fn normalize_session_scope(metadata: &Map<String, Value>, timestamp: DateTime<Utc>) -> String {
    let raw_session = metadata.get("session_id").and_then(Value::as_str).unwrap_or("").trim().to_string();
    if !raw_session.is_empty() {
        return raw_session;
    }
    timestamp.date_naive().to_string()
}

/// A set-context row as seen by the mention-drift evaluator: the
/// correction-resolved data a `set.logged` row effectively carries, its
/// metadata, and the timestamp used for session-scope fallback.
pub struct MentionRow<'a> {
    pub effective_data: &'a Map<String, Value>,
    pub metadata: &'a Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SetContextEvaluation {
    pub session_scope: String,
    pub exercise_scope: String,
    pub modality: Modality,
    pub missing_fields: Vec<&'static str>,
    pub hint_messages: Vec<String>,
}

fn hint_for_field(field: &str) -> String {
    match field {
        "rest_seconds" => "Persist rest_seconds from mention/default to avoid loss (e.g. pause 90 sec).",
        "tempo" => "Persist tempo when mentioned so subsequent sets inherit correctly.",
        "rir" => "Persist RIR when mentioned; do not keep it only in narrative text.",
        "set_type" => "Persist set_type when mention indicates warmup/backoff/amrap context.",
        _ => "Persist mentioned field to avoid drift.",
    }
    .to_string()
}

/// Apply mention defaults per session+exercise scope and flag fields that
/// were defaulted-from-mention but never persisted in the row's own
/// structured data.
pub fn evaluate_set_context_rows(rows: &[MentionRow<'_>]) -> Vec<SetContextEvaluation> {
    let mut defaults_by_scope: HashMap<(String, String), Map<String, Value>> = HashMap::new();
    let mut evaluations = Vec::with_capacity(rows.len());

    for row in rows {
        let modality = normalized_modality(row.effective_data);
        let mention_bound_fields = modality.mention_bound_fields();
        let session_scope = normalize_session_scope(row.metadata, row.timestamp);
        let exercise_scope = normalize_exercise_scope(row.effective_data);
        let scope = (session_scope.clone(), exercise_scope.clone());
        let mut current_defaults = defaults_by_scope.get(&scope).cloned().unwrap_or_default();

        let mentions = extract_payload_mentions(row.effective_data, row.metadata);
        for field in mention_bound_fields {
            if let Some(value) = mentions.get(*field) {
                current_defaults.insert((*field).to_string(), value.clone());
            }
        }

        if let Some(rest) = row.effective_data.get("rest_seconds").and_then(to_f64).and_then(normalize_rest_seconds) {
            current_defaults.insert("rest_seconds".to_string(), json!(rest));
        }
        if let Some(rir) = row.effective_data.get("rir").and_then(to_f64) {
            current_defaults.insert("rir".to_string(), json!(normalize_rir(rir)));
        }
        if let Some(Value::String(tempo)) = row.effective_data.get("tempo") {
            if !tempo.trim().is_empty() {
                current_defaults.insert("tempo".to_string(), json!(tempo.trim().to_lowercase()));
            }
        }
        if let Some(Value::String(set_type)) = row.effective_data.get("set_type") {
            if let Some(normalized) = normalize_set_type(set_type) {
                current_defaults.insert("set_type".to_string(), json!(normalized));
            }
        }

        let mut sorted_fields: Vec<&'static str> = mention_bound_fields.to_vec();
        sorted_fields.sort_unstable();
        let mut missing_fields = Vec::new();
        let mut hint_messages = Vec::new();
        for field in sorted_fields {
            if !current_defaults.contains_key(field) {
                continue;
            }
            if row.effective_data.get(field).is_some_and(|v| !v.is_null()) {
                continue;
            }
            missing_fields.push(field);
            hint_messages.push(hint_for_field(field));
        }

        defaults_by_scope.insert(scope, current_defaults);
        evaluations.push(SetContextEvaluation { session_scope, exercise_scope, modality, missing_fields, hint_messages });
    }

    evaluations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rest_seconds_from_free_text() {
        let mentions = extract_set_context_mentions("pause 90 sec before next set");
        assert_eq!(mentions.get("rest_seconds"), Some(&json!(90.0)));
    }

    #[test]
    fn extracts_rest_from_mmss_notation() {
        let mentions = extract_set_context_mentions("rest 1:30");
        assert_eq!(mentions.get("rest_seconds"), Some(&json!(90.0)));
    }

    #[test]
    fn extracts_tempo_and_rir() {
        let mentions = extract_set_context_mentions("tempo 3-1-1-0, 2 rir");
        assert_eq!(mentions.get("tempo"), Some(&json!("3-1-1-0")));
        assert_eq!(mentions.get("rir"), Some(&json!(2.0)));
    }

    #[test]
    fn carries_mention_default_forward_and_flags_missing_persisted_field() {
        let metadata = Map::new();
        let first_data: Map<String, Value> = json!({"exercise_id": "barbell_back_squat", "notes": "rest 90 sec"}).as_object().unwrap().clone();
        let second_data: Map<String, Value> = json!({"exercise_id": "barbell_back_squat"}).as_object().unwrap().clone();
        let timestamp = Utc::now();
        let rows = vec![
            MentionRow { effective_data: &first_data, metadata: &metadata, timestamp },
            MentionRow { effective_data: &second_data, metadata: &metadata, timestamp },
        ];
        let evaluations = evaluate_set_context_rows(&rows);
        assert!(evaluations[0].missing_fields.is_empty());
        assert!(evaluations[1].missing_fields.contains(&"rest_seconds"));
    }

    #[test]
    fn explicit_structured_value_clears_missing_flag() {
        let metadata = Map::new();
        let first_data: Map<String, Value> = json!({"exercise_id": "barbell_back_squat", "notes": "rest 90 sec"}).as_object().unwrap().clone();
        let second_data: Map<String, Value> = json!({"exercise_id": "barbell_back_squat", "rest_seconds": 90}).as_object().unwrap().clone();
        let timestamp = Utc::now();
        let rows = vec![
            MentionRow { effective_data: &first_data, metadata: &metadata, timestamp },
            MentionRow { effective_data: &second_data, metadata: &metadata, timestamp },
        ];
        let evaluations = evaluate_set_context_rows(&rows);
        assert!(evaluations[1].missing_fields.is_empty());
    }
}
