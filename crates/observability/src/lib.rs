//! Structured logging/tracing initialization (spec §A.2), shared by
//! `kura-daemon` and every crate's test binaries that want consistent
//! output without duplicating `tracing-subscriber` setup.

pub use tracing::LogFormat;

/// Initialize process-wide observability (tracing/logging).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}

/// Tracing configuration (filters, layers, JSON vs plain formatting).
pub mod tracing;


