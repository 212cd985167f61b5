//! Event, job, projection, and inference-run entities plus the store/queue
//! traits that `kura-store` implements and `kura-handlers`/`kura-worker`
//! consume (C1's contract, spec §4.1).

mod append;
mod error;
mod event;
mod inference_run;
mod job;
mod projection;
mod store;

pub use append::append_and_enqueue;
pub use error::{EventsError, EventsResult};
pub use event::{chronological_key, sort_chronologically, Event, NewEvent};
pub use inference_run::{ErrorTaxonomy, InferenceRun, InferenceStatus};
pub use job::{job_type, retry_backoff_seconds, Job, JobStatus, NewJob};
pub use projection::{Projection, ProjectionWrite};
pub use store::{EventStore, InferenceRunStore, JobQueue, NotifyBus, ProjectionStore, SchemaCapabilityStore};

