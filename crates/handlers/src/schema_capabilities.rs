//! Schema-capability degradation (spec §A.6): optional relations a handler
//! may enrich from when present, checked live rather than assumed, so a
//! deployment that is a migration behind degrades one note in
//! `data_quality` instead of failing the whole projection recompute.
//! Ported from the import worker's relation-capability probe.

use std::sync::Arc;

use kura_events::SchemaCapabilityStore;
use serde::Serialize;

/// One relation a handler can optionally read from, and what happens when
/// it's missing.
struct RelationSpec {
    relation_name: &'static str,
    required_by: &'static [&'static str],
    fallback_behavior: &'static str,
}

const RELATION_SPECS: &[RelationSpec] = &[RelationSpec {
    relation_name: "external_import_jobs",
    required_by: &["quality_health", "training_timeline"],
    fallback_behavior: "external-import provenance (unsupported fields, dedup/parse taxonomy) is omitted from data_quality until the relation exists",
}];

#[derive(Debug, Clone, Serialize)]
pub struct RelationCapability {
    pub relation_name: &'static str,
    pub available: bool,
    pub required_by: &'static [&'static str],
    pub fallback_behavior: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaCapabilityReport {
    pub status: &'static str,
    pub missing_relations: Vec<&'static str>,
    pub relations: Vec<RelationCapability>,
}

/// Probes every known optional relation and builds the report a handler
/// threads into `data_quality.schema_capabilities`.
pub async fn detect_schema_capabilities(store: &Arc<dyn SchemaCapabilityStore>) -> SchemaCapabilityReport {
    let mut relations = Vec::with_capacity(RELATION_SPECS.len());
    let mut missing_relations = Vec::new();

    for spec in RELATION_SPECS {
        let available = store.relation_exists(spec.relation_name).await.unwrap_or(false);
        if !available {
            missing_relations.push(spec.relation_name);
        }
        relations.push(RelationCapability { relation_name: spec.relation_name, available, required_by: spec.required_by, fallback_behavior: spec.fallback_behavior });
    }

    let status = if missing_relations.is_empty() { "healthy" } else { "degraded" };
    SchemaCapabilityReport { status, missing_relations, relations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kura_events::EventsResult;

    struct AlwaysMissing;

    #[async_trait]
    impl SchemaCapabilityStore for AlwaysMissing {
        async fn relation_exists(&self, _relation_name: &str) -> EventsResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn missing_relation_degrades_the_report() {
        let store: Arc<dyn SchemaCapabilityStore> = Arc::new(AlwaysMissing);
        let report = detect_schema_capabilities(&store).await;
        assert_eq!(report.status, "degraded");
        assert!(report.missing_relations.contains(&"external_import_jobs"));
    }

    #[tokio::test]
    async fn every_relation_present_is_healthy() {
        let store: Arc<dyn SchemaCapabilityStore> = Arc::new(kura_store::InMemorySchemaCapabilities::new());
        let report = detect_schema_capabilities(&store).await;
        assert_eq!(report.status, "healthy");
        assert!(report.missing_relations.is_empty());
    }
}
