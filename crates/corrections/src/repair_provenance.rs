//! Repair provenance contract helpers (spec §3.1, §4.6.2; ported from
//! `repair_provenance.py`).
//!
//! Distinct from training-timeline's own confidence banding (DESIGN.md) —
//! this banding is specifically for repair/correction provenance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SOURCE_TYPES: &[&str] = &["explicit", "inferred", "estimated", "user_confirmed"];
const SCOPES: &[&str] = &["single_set", "exercise_session", "session"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Clamp to `[0,1]` and band at `>=0.86` high / `>=0.6` medium / else low.
pub fn normalize_confidence(value: f64) -> (f64, ConfidenceBand) {
    let clamped = value.clamp(0.0, 1.0);
    let band = if clamped >= 0.86 {
        ConfidenceBand::High
    } else if clamped >= 0.6 {
        ConfidenceBand::Medium
    } else {
        ConfidenceBand::Low
    };
    ((clamped * 1000.0).round() / 1000.0, band)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairProvenance {
    pub source_type: String,
    pub confidence: f64,
    pub confidence_band: ConfidenceBand,
    pub applies_scope: String,
    pub reason: String,
}

pub fn build_repair_provenance(source_type: &str, confidence: f64, applies_scope: &str, reason: &str) -> RepairProvenance {
    let normalized_source = source_type.trim().to_lowercase();
    let normalized_source = if SOURCE_TYPES.contains(&normalized_source.as_str()) {
        normalized_source
    } else {
        "estimated".to_string()
    };

    let normalized_scope = applies_scope.trim().to_lowercase();
    let normalized_scope = if SCOPES.contains(&normalized_scope.as_str()) {
        normalized_scope
    } else {
        "session".to_string()
    };

    let (confidence, confidence_band) = normalize_confidence(confidence);
    let reason = reason.trim();
    let reason = if reason.is_empty() { "unspecified_repair_reason".to_string() } else { reason.to_string() };

    RepairProvenance {
        source_type: normalized_source,
        confidence,
        confidence_band,
        applies_scope: normalized_scope,
        reason,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairProvenanceSummary {
    pub entries: usize,
    pub by_source_type: HashMap<String, usize>,
    pub by_confidence_band: HashMap<String, usize>,
    pub low_confidence_entries: usize,
}

pub fn summarize_repair_provenance(entries: &[RepairProvenance]) -> RepairProvenanceSummary {
    let mut summary = RepairProvenanceSummary::default();
    for entry in entries {
        summary.entries += 1;
        *summary.by_source_type.entry(entry.source_type.clone()).or_insert(0) += 1;
        *summary.by_confidence_band.entry(entry.confidence_band.as_str().to_string()).or_insert(0) += 1;
        if entry.confidence_band == ConfidenceBand::Low {
            summary.low_confidence_entries += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_match_spec_thresholds() {
        assert_eq!(normalize_confidence(0.95).1, ConfidenceBand::High);
        assert_eq!(normalize_confidence(0.86).1, ConfidenceBand::High);
        assert_eq!(normalize_confidence(0.6).1, ConfidenceBand::Medium);
        assert_eq!(normalize_confidence(0.45).1, ConfidenceBand::Low);
    }

    #[test]
    fn unknown_source_type_falls_back_to_estimated() {
        let p = build_repair_provenance("guessed", 0.9, "single_set", "alias repair");
        assert_eq!(p.source_type, "estimated");
    }
}
