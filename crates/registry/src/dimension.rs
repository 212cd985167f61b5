//! Dimension metadata (spec §4.2): human description, expected projection
//! key shape, granularity tags, related dimensions, context seeds, and
//! output schema, recorded alongside each handler's registration.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct DimensionMeta {
    pub name: &'static str,
    pub description: &'static str,
    /// How projection keys are shaped for this dimension, e.g. "single
    /// `overview` key" or "one key per canonical exercise".
    pub key_shape: &'static str,
    pub granularity_tags: &'static [&'static str],
    pub related_dimensions: &'static [&'static str],
    pub context_seeds: &'static [&'static str],
    /// A description of the projection payload shape, used by the
    /// user_profile system layer (spec §4.4.8) and for introspection —
    /// deliberately loose (`Value`) since handlers' payloads are themselves
    /// untyped documents (spec §9's "Dynamic payloads" row).
    pub output_schema: Value,
}
