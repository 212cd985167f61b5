//! Concrete `kura-events` trait implementations: Postgres for production,
//! in-memory for tests and local development (spec §A.1).

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::map_sqlx_error;
pub use memory::{InMemoryEventStore, InMemoryInferenceRunStore, InMemoryJobQueue, InMemoryNotifyBus, InMemoryProjectionStore, InMemorySchemaCapabilities};
pub use postgres::PostgresStore;
