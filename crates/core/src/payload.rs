//! `Payload` wraps the unstructured `data`/`metadata` documents carried by
//! every event and projection row.
//!
//! Handlers parse payloads into their own tagged shapes at the boundary and
//! keep whatever they don't recognize under `observed_attributes` rather than
//! rejecting it — the event-type catalog is fixed, but individual fields
//! drift as the writers evolve.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object payload, with lossy coercion helpers matching the tolerant
/// parsing the handlers need (string/number coercion, case-insensitive keys
/// are the caller's job, missing values become `None` rather than errors).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload(Value);

impl Payload {
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn new(value: Value) -> Self {
        match value {
            Value::Object(_) => Self(value),
            _ => Self::empty(),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        match &self.0 {
            Value::Object(map) => map,
            _ => unreachable!("Payload invariant: always an object"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Trimmed, lowercased string, or empty string for absent/non-string values.
    pub fn normalized_str(&self, key: &str) -> String {
        normalize(self.get(key))
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        to_f64(self.get(key))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key).and_then(Value::as_array)
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.as_map().keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.as_map().contains_key(key)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}

/// Best-effort float coercion: numbers pass through, numeric strings parse,
/// everything else (including `null`, booleans, objects) is `None`.
pub fn to_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Trimmed, lowercased string coercion used throughout the quality/handler
/// layer for case-insensitive comparisons of user-controlled strings.
pub fn normalize(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_lowercase(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_numeric_strings() {
        let payload = Payload::new(json!({"weight_kg": "100.5", "reps": 5}));
        assert_eq!(payload.get_f64("weight_kg"), Some(100.5));
        assert_eq!(payload.get_f64("reps"), Some(5.0));
        assert_eq!(payload.get_f64("missing"), None);
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let payload = Payload::new(json!({"exercise": "  Kniebeuge "}));
        assert_eq!(payload.normalized_str("exercise"), "kniebeuge");
    }

    #[test]
    fn non_object_input_becomes_empty() {
        let payload = Payload::new(json!("not an object"));
        assert!(payload.as_map().is_empty());
    }
}
