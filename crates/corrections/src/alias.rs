//! Per-user alias map (GLOSSARY "Alias map") reconstructed from
//! `exercise.alias_created` events, and cycle-safe resolution (spec §9's
//! "Alias graphs" re-architecture row).

use std::collections::HashMap;

use kura_events::Event;

/// Lowercased-term -> canonical-key map, built from every non-retracted
/// `exercise.alias_created` event for a user (latest wins on conflict).
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    entries: HashMap<String, String>,
}

const MAX_CHAIN_DEPTH: usize = 16;

impl AliasMap {
    pub fn build(events: &[Event]) -> Self {
        let mut entries = HashMap::new();
        for event in events {
            if event.event_type != "exercise.alias_created" {
                continue;
            }
            let Some(alias) = event.data.get_str("alias") else {
                continue;
            };
            let Some(canonical) = event.data.get_str("exercise_id") else {
                continue;
            };
            entries.insert(alias.trim().to_lowercase(), canonical.trim().to_string());
        }
        Self { entries }
    }

    /// Resolve `term` to a canonical key, walking alias chains with a
    /// visited set and a depth cap so a cycle can never loop forever.
    /// Returns `None` if the term has no alias (caller falls back to the
    /// static catalog).
    pub fn resolve(&self, term: &str) -> Option<String> {
        let mut current = term.trim().to_lowercase();
        let mut visited = std::collections::HashSet::new();
        let mut last_resolved: Option<String> = None;

        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(next) = self.entries.get(&current) else {
                break;
            };
            if !visited.insert(current.clone()) {
                break;
            }
            last_resolved = Some(next.clone());
            current = next.trim().to_lowercase();
        }

        last_resolved
    }

    pub fn contains(&self, term: &str) -> bool {
        self.entries.contains_key(&term.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::{Payload, UserId};
    use serde_json::json;

    fn alias_event(alias: &str, canonical: &str) -> Event {
        Event {
            event_id: kura_core::EventId::new(),
            user_id: UserId::new(),
            timestamp: Utc::now(),
            event_type: "exercise.alias_created".to_string(),
            data: Payload::new(json!({"alias": alias, "exercise_id": canonical})),
            metadata: Payload::empty(),
        }
    }

    #[test]
    fn resolves_direct_alias() {
        let map = AliasMap::build(&[alias_event("Kniebeuge", "barbell_back_squat")]);
        assert_eq!(map.resolve("kniebeuge"), Some("barbell_back_squat".to_string()));
    }

    #[test]
    fn cyclic_alias_chain_terminates() {
        let map = AliasMap::build(&[alias_event("a", "b"), alias_event("b", "a")]);
        // Must not hang; resolution terminates via the visited-set cap.
        let _ = map.resolve("a");
    }

    #[test]
    fn unknown_term_resolves_to_none() {
        let map = AliasMap::build(&[]);
        assert_eq!(map.resolve("bench press"), None);
    }
}
