//! The retraction/correction overlay model (C3, spec §4.3) plus the
//! supporting resolvers every C4 handler shares: alias resolution, the
//! static semantic catalog, session-boundary fallback, repair provenance,
//! and the external-import issue taxonomy.

mod alias;
mod catalog;
mod import_taxonomy;
mod repair_provenance;
mod retraction;
mod session_boundary;
mod set_correction;

pub use alias::AliasMap;
pub use catalog::{resolve_exercise_term, slugify, CatalogEntry, CatalogMatch, EXERCISE_CATALOG};
pub use import_taxonomy::{classify_import_error_code, is_import_parse_quality_failure, tally_by_kind, ImportErrorClass, ImportIssue, ImportIssueKind};
pub use repair_provenance::{
    build_repair_provenance, normalize_confidence, summarize_repair_provenance, ConfidenceBand, RepairProvenance,
    RepairProvenanceSummary,
};
pub use retraction::{active_events, retracted_ids};
pub use session_boundary::{assign_fallback_sessions, fallback_session_key};
pub use set_correction::{apply_set_correction_chain, CorrectedSet, CorrectionHistoryEntry};
