//! Maps `sqlx` failures onto the `kura-events` error contract at the boundary
//! (spec §A.3) — the rest of the workspace only ever sees `EventsError`.

use kura_events::EventsError;

pub fn map_sqlx_error(context: &str, error: sqlx::Error) -> EventsError {
    match &error {
        sqlx::Error::RowNotFound => EventsError::NotFound,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23505") => EventsError::Conflict(format!("{context}: unique constraint violated")),
            _ => EventsError::Unavailable(format!("{context}: {error}")),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => EventsError::Unavailable(format!("{context}: connection pool unavailable")),
        _ => EventsError::Unavailable(format!("{context}: {error}")),
    }
}
