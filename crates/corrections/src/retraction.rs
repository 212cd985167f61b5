//! Active event set computation (C3, spec §4.3 "Active event set").
//!
//! `event.retracted` referencing event E removes E from all subsequent
//! derivations; retraction records themselves are never observed as domain
//! facts (spec §3.2 "Retraction transitivity").

use std::collections::HashSet;

use kura_core::EventId;
use kura_events::Event;

const RETRACTION_EVENT_TYPE: &str = "event.retracted";

/// Filter `events` down to the active set: remove `event.retracted` rows and
/// the targets they reference. Input order is preserved.
pub fn active_events(events: Vec<Event>) -> Vec<Event> {
    let retracted = retracted_ids(&events);
    events
        .into_iter()
        .filter(|e| e.event_type != RETRACTION_EVENT_TYPE && !retracted.contains(&e.event_id))
        .collect()
}

/// Collect the set of event ids referenced by `event.retracted` rows.
pub fn retracted_ids(events: &[Event]) -> HashSet<EventId> {
    events
        .iter()
        .filter(|e| e.event_type == RETRACTION_EVENT_TYPE)
        .filter_map(|e| e.data.get_str("retracted_event_id"))
        .filter_map(|id| id.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::{Payload, UserId};
    use serde_json::json;

    fn make(event_type: &str, data: serde_json::Value) -> Event {
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
    fn retraction_removes_target_and_itself() {
        let target = make("bodyweight.logged", json!({"weight_kg": 150}));
        let retraction = make(
            "event.retracted",
            json!({"retracted_event_id": target.event_id.to_string()}),
        );
        let survivor = make("bodyweight.logged", json!({"weight_kg": 85}));

        let result = active_events(vec![target, retraction, survivor.clone()]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].event_id, survivor.event_id);
    }

    #[test]
    fn retraction_is_monotonic() {
        let a = make("set.logged", json!({"weight_kg": 100}));
        let b = make("set.logged", json!({"weight_kg": 110}));
        let retraction = make(
            "event.retracted",
            json!({"retracted_event_id": a.event_id.to_string()}),
        );

        let with_retraction = active_events(vec![a.clone(), b.clone(), retraction]);
        let without_a = active_events(vec![b.clone()]);
        assert_eq!(
            with_retraction.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            without_a.iter().map(|e| e.event_id).collect::<Vec<_>>()
        );
    }
}
