//! Core domain types shared by every crate in the projection engine.
//!
//! This crate has no I/O and no knowledge of Postgres, job queues, or HTTP.
//! It only defines identifiers, the error model, and the `Payload` type used
//! to carry the unstructured `data`/`metadata` documents that events and
//! projections exchange.

mod error;
mod ids;
mod payload;

pub use error::{DomainError, DomainResult};
pub use ids::{EventId, JobId, ProposalId, UserId};
pub use payload::Payload;
