//! The handler registry (C2, spec §4.2): a process-wide mapping from event
//! type to ordered projection builders, plus per-dimension metadata.

mod dimension;
mod handler;
mod registry;

pub use dimension::DimensionMeta;
pub use handler::{Handler, HandlerContext, HandlerInvocation, HandlerOutcome};
pub use registry::{Registry, RegistryBuilder};
