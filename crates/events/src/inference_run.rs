//! Inference-run telemetry (spec §3.1: "Inference run").
//!
//! Append-only; never mutated. Recorded by every handler that calls into
//! `kura-inference`, and by the `analysis.deep_insight` job stub.

use chrono::{DateTime, Utc};
use kura_core::{Payload, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Success,
    Failed,
    Skipped,
}

/// Classified error kinds for inference failures (spec §7).
///
/// Classified by substring inspection of the error text, matching the
/// original's taxonomy — this is deliberately a coarse, best-effort
/// classification rather than a typed error hierarchy, since the inference
/// engines themselves are out of scope and may fail in engine-specific ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTaxonomy {
    InsufficientData,
    NumericInstability,
    EngineUnavailable,
    Unexpected,
}

impl ErrorTaxonomy {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient") || lower.contains("not enough data") {
            Self::InsufficientData
        } else if lower.contains("numeric") || lower.contains("converge") || lower.contains("nan") || lower.contains("overflow") {
            Self::NumericInstability
        } else if lower.contains("unavailable") || lower.contains("timeout") || lower.contains("connection") {
            Self::EngineUnavailable
        } else {
            Self::Unexpected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRun {
    pub user_id: UserId,
    pub projection_type: String,
    pub key: String,
    pub engine: String,
    pub status: InferenceStatus,
    pub diagnostics: Payload,
    pub error_message: Option<String>,
    pub error_taxonomy: Option<ErrorTaxonomy>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_insufficient_data_messages() {
        assert_eq!(
            ErrorTaxonomy::classify("insufficient data: need at least 3 points"),
            ErrorTaxonomy::InsufficientData
        );
    }

    #[test]
    fn falls_back_to_unexpected() {
        assert_eq!(ErrorTaxonomy::classify("division produced a weird result"), ErrorTaxonomy::Unexpected);
    }
}
