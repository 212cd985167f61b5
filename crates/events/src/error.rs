//! Error model for the store/queue contract (spec §4.1).

use thiserror::Error;

pub type EventsResult<T> = Result<T, EventsError>;

/// Errors surfaced by an `EventStore`/`ProjectionStore`/`JobQueue` implementation.
///
/// This crate defines the contract only; concrete backends (`kura-store`)
/// map their own I/O failures into this enum at the boundary.
#[derive(Debug, Error)]
pub enum EventsError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(#[from] kura_core::DomainError),
}
