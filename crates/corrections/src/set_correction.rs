//! Set-correction overlay (C3, spec §4.3 "Set-correction overlay", §8.1
//! "Correction overlay order").
//!
//! Ported from `apply_set_correction_chain` in the reference implementation:
//! corrections are applied in ascending `(timestamp, correction_event_id)`
//! order; the latest value for a patched field wins.

use std::collections::HashMap;

use kura_core::EventId;
use kura_events::Event;
use serde_json::Value;

/// One entry in a set row's `correction_history`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CorrectionHistoryEntry {
    pub correction_event_id: EventId,
    pub target_event_id: EventId,
    pub field: String,
    pub value: Value,
    pub applied_at: chrono::DateTime<chrono::Utc>,
    pub reason: Option<String>,
    pub repair_provenance: Option<Value>,
}

/// A `set.logged` row with the correction overlay resolved on top of it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CorrectedSet {
    pub event: Event,
    pub effective_data: serde_json::Map<String, Value>,
    pub correction_history: Vec<CorrectionHistoryEntry>,
    pub field_provenance: HashMap<String, Value>,
}

impl CorrectedSet {
    fn fresh(event: Event) -> Self {
        let effective_data = event.data.as_map().clone();
        Self {
            event,
            effective_data,
            correction_history: Vec::new(),
            field_provenance: HashMap::new(),
        }
    }
}

/// A value under `changed_fields` is either the raw new value, or
/// `{value, repair_provenance}` carrying a per-field provenance override.
fn changed_field_value_and_provenance(
    raw_value: &Value,
    bundle_provenance: Option<&Value>,
) -> (Value, Option<Value>) {
    if let Value::Object(map) = raw_value {
        if let Some(value) = map.get("value") {
            let field_provenance = map.get("repair_provenance").filter(|v| v.is_object());
            return (
                value.clone(),
                field_provenance.cloned().or_else(|| bundle_provenance.cloned()),
            );
        }
    }
    (raw_value.clone(), bundle_provenance.cloned())
}

/// Apply `set.corrected` events onto `set.logged` rows. `set_rows` and
/// `correction_rows` should already be retraction-filtered; this function
/// does not consult the retraction overlay itself.
pub fn apply_set_correction_chain(set_rows: Vec<Event>, correction_rows: &[Event]) -> Vec<CorrectedSet> {
    let mut by_id: HashMap<EventId, usize> = HashMap::new();
    let mut corrected: Vec<CorrectedSet> = Vec::with_capacity(set_rows.len());
    for (idx, row) in set_rows.into_iter().enumerate() {
        by_id.insert(row.event_id, idx);
        corrected.push(CorrectedSet::fresh(row));
    }

    let mut ordered: Vec<&Event> = correction_rows.iter().collect();
    ordered.sort_by(|a, b| (a.timestamp, a.event_id).cmp(&(b.timestamp, b.event_id)));

    for correction in ordered {
        let Some(target_id_str) = correction.data.get_str("target_event_id") else {
            continue;
        };
        let Ok(target_id) = target_id_str.parse::<EventId>() else {
            continue;
        };
        let Some(&idx) = by_id.get(&target_id) else {
            continue;
        };

        let Some(changed_fields) = correction.data.get_object("changed_fields") else {
            continue;
        };
        let bundle_provenance = correction.data.get("repair_provenance").filter(|v| v.is_object());
        let reason = correction.data.get_str("reason").map(str::to_string);

        let target = &mut corrected[idx];
        for (field, raw_value) in changed_fields {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (value, field_provenance) = changed_field_value_and_provenance(raw_value, bundle_provenance);
            target.effective_data.insert(field.to_string(), value.clone());
            if let Some(provenance) = field_provenance.clone() {
                target.field_provenance.insert(field.to_string(), provenance);
            }
            target.correction_history.push(CorrectionHistoryEntry {
                correction_event_id: correction.event_id,
                target_event_id: target_id,
                field: field.to_string(),
                value,
                applied_at: correction.timestamp,
                reason: reason.clone(),
                repair_provenance: field_provenance,
            });
        }
    }

    corrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kura_core::{Payload, UserId};
    use serde_json::json;

    fn make(ts: chrono::DateTime<Utc>, event_type: &str, data: Value) -> Event {
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
    fn later_correction_wins_for_same_field() {
        let t0 = Utc::now();
        let set = make(t0, "set.logged", json!({"weight_kg": 100, "reps": 5}));
        let c1 = make(
            t0 + Duration::seconds(1),
            "set.corrected",
            json!({"target_event_id": set.event_id.to_string(), "changed_fields": {"rest_seconds": 60}}),
        );
        let c2 = make(
            t0 + Duration::seconds(2),
            "set.corrected",
            json!({"target_event_id": set.event_id.to_string(), "changed_fields": {"rest_seconds": 90}}),
        );

        let result = apply_set_correction_chain(vec![set], &[c2, c1]);
        assert_eq!(result[0].effective_data.get("rest_seconds"), Some(&json!(90)));
        assert_eq!(result[0].correction_history.len(), 2);
    }

    #[test]
    fn value_provenance_bundle_shape_is_unwrapped() {
        let t0 = Utc::now();
        let set = make(t0, "set.logged", json!({"weight_kg": 100}));
        let correction = make(
            t0 + Duration::seconds(1),
            "set.corrected",
            json!({
                "target_event_id": set.event_id.to_string(),
                "changed_fields": {
                    "weight_kg": {"value": 102.5, "repair_provenance": {"source_type": "user_confirmed", "confidence": 0.95}}
                }
            }),
        );

        let result = apply_set_correction_chain(vec![set], &[correction]);
        assert_eq!(result[0].effective_data.get("weight_kg"), Some(&json!(102.5)));
        assert!(result[0].field_provenance.contains_key("weight_kg"));
    }
}
