//! External import error taxonomy (spec §A.6, INV-009 §4.6.1).
//!
//! Fixed taxonomy of issue kinds raised while ingesting externally-imported
//! activities (training-timeline §4.4.2) and evaluated by INV-009.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportIssueKind {
    UnsupportedField,
    LowConfidenceMapping,
    TemporalUncertainty,
    ParseFailure,
    DedupRejection,
}

/// Stable classification of an external import job's `error_code`, ported
/// from the import worker's error taxonomy so INV-009 can tally
/// parse-quality failures and dedup rejections without re-deriving the
/// mapping ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportErrorClass {
    Parse,
    Mapping,
    Validation,
    Dedup,
    Other,
}

impl ImportErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Mapping => "mapping",
            Self::Validation => "validation",
            Self::Dedup => "dedup",
            Self::Other => "other",
        }
    }
}

/// Classifies a raw `error_code` into its stable class, defaulting to
/// `Other` for blank or unrecognized codes.
pub fn classify_import_error_code(error_code: Option<&str>) -> ImportErrorClass {
    let normalized = error_code.unwrap_or_default().trim().to_lowercase();
    match normalized.as_str() {
        "parse_error" | "unsupported_format" => ImportErrorClass::Parse,
        "mapping_error" => ImportErrorClass::Mapping,
        "validation_error" => ImportErrorClass::Validation,
        "stale_version" | "version_conflict" | "partial_overlap" => ImportErrorClass::Dedup,
        _ => ImportErrorClass::Other,
    }
}

/// `true` when the error code reflects a parse-quality problem (parse,
/// mapping, or validation) rather than a dedup rejection or unclassified
/// error.
pub fn is_import_parse_quality_failure(error_code: Option<&str>) -> bool {
    matches!(classify_import_error_code(error_code), ImportErrorClass::Parse | ImportErrorClass::Mapping | ImportErrorClass::Validation)
}

impl ImportIssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedField => "unsupported_field",
            Self::LowConfidenceMapping => "low_confidence_mapping",
            Self::TemporalUncertainty => "temporal_uncertainty",
            Self::ParseFailure => "parse_failure",
            Self::DedupRejection => "dedup_rejection",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportIssue {
    pub kind: ImportIssueKind,
    pub field: Option<String>,
    pub detail: String,
}

/// Tally issues by kind for a projection's `data_quality` block.
pub fn tally_by_kind(issues: &[ImportIssue]) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for issue in issues {
        *counts.entry(issue.kind.as_str()).or_insert(0) += 1;
    }
    counts
}
