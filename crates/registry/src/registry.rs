//! The process-wide handler registry (C2, spec §4.2).
//!
//! Populated once at startup in a fixed order that guarantees `user_profile`
//! registers last; read-only thereafter (spec §5 "Shared-resource policy").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dimension::DimensionMeta;
use crate::handler::Handler;

pub struct Registry {
    by_event_type: HashMap<String, Vec<Arc<dyn Handler>>>,
    dimension_metadata: HashMap<&'static str, DimensionMeta>,
    registered_event_types: HashSet<String>,
    by_dimension: HashMap<&'static str, Arc<dyn Handler>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Deterministic order: the order handlers were registered in.
    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn Handler>] {
        self.by_event_type.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dimension_metadata(&self) -> &HashMap<&'static str, DimensionMeta> {
        &self.dimension_metadata
    }

    /// Every event type with at least one registered handler — used to
    /// detect orphaned event types for agent housekeeping (spec §4.2).
    pub fn registered_event_types(&self) -> &HashSet<String> {
        &self.registered_event_types
    }

    pub fn is_orphaned(&self, event_type: &str) -> bool {
        !self.registered_event_types.contains(event_type)
    }

    /// The handler declaring a given dimension, if any — used by the
    /// user_profile aggregator to call each dimension's
    /// `manifest_contribution` hook (spec §4.4.8).
    pub fn handler_for_dimension(&self, dimension: &str) -> Option<&Arc<dyn Handler>> {
        self.by_dimension.get(dimension)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    by_event_type: HashMap<String, Vec<Arc<dyn Handler>>>,
    dimension_metadata: HashMap<&'static str, DimensionMeta>,
    registered_event_types: HashSet<String>,
    by_dimension: HashMap<&'static str, Arc<dyn Handler>>,
    order: Vec<&'static str>,
}

impl RegistryBuilder {
    /// `Register(event_types, handler, dimension_meta)` — spec §9's
    /// re-architecture row for decorator-based registration. Call in a
    /// fixed init sequence; there is no post-init mutation path.
    pub fn register(mut self, event_types: &[&str], handler: Arc<dyn Handler>, meta: DimensionMeta) -> Self {
        let name = meta.name;
        if self.dimension_metadata.contains_key(name) {
            panic!("dimension '{name}' registered twice");
        }
        self.order.push(name);
        self.dimension_metadata.insert(name, meta);
        self.by_dimension.insert(name, Arc::clone(&handler));

        for event_type in event_types {
            self.registered_event_types.insert(event_type.to_string());
            self.by_event_type
                .entry(event_type.to_string())
                .or_default()
                .push(Arc::clone(&handler));
        }
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            by_event_type: self.by_event_type,
            dimension_metadata: self.dimension_metadata,
            registered_event_types: self.registered_event_types,
            by_dimension: self.by_dimension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerInvocation, HandlerOutcome};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop(&'static str);

    #[async_trait]
    impl Handler for Noop {
        fn dimension(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, _ctx: &HandlerContext, _invocation: &HandlerInvocation) -> HandlerOutcome {
            HandlerOutcome::Completed
        }
    }

    fn meta(name: &'static str) -> DimensionMeta {
        DimensionMeta {
            name,
            description: "test",
            key_shape: "single",
            granularity_tags: &[],
            related_dimensions: &[],
            context_seeds: &[],
            output_schema: json!({}),
        }
    }

    #[test]
    fn handlers_dispatch_in_registration_order() {
        let registry = Registry::builder()
            .register(&["set.logged"], Arc::new(Noop("a")), meta("a"))
            .register(&["set.logged"], Arc::new(Noop("b")), meta("b"))
            .build();

        let handlers = registry.handlers_for("set.logged");
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].dimension(), "a");
        assert_eq!(handlers[1].dimension(), "b");
    }

    #[test]
    fn unregistered_event_type_has_no_handlers_and_is_orphaned() {
        let registry = Registry::builder().register(&["set.logged"], Arc::new(Noop("a")), meta("a")).build();
        assert!(registry.handlers_for("unknown.thing").is_empty());
        assert!(registry.is_orphaned("unknown.thing"));
        assert!(!registry.is_orphaned("set.logged"));
    }
}
