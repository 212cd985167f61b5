//! The background job entity and fixed job-type catalog (spec §3.1, §6.4,
//! §A.6's job catalog supplement).

use chrono::{DateTime, Utc};
use kura_core::{JobId, Payload, UserId};
use serde::{Deserialize, Serialize};

/// Fixed job-type catalog. New job types are not dynamically registered;
/// the worker dead-letters anything it doesn't recognize (spec §4.5 step 3).
pub mod job_type {
    pub const PROJECTION_UPDATE: &str = "projection.update";
    pub const DEEP_INSIGHT: &str = "analysis.deep_insight";
    pub const LOG_RETENTION: &str = "maintenance.log_retention";
    pub const ACCOUNT_HARD_DELETE: &str = "account.hard_delete";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

/// A claimed or queued job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user_id: UserId,
    pub job_type: String,
    pub payload: Payload,
    pub status: JobStatus,
    pub attempt: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// `max_retries` counts retries, not attempts: with `max_retries=3` the
    /// schedule is attempt 1 fails → retry in 2s, attempt 2 fails → retry in
    /// 4s, attempt 3 fails → retry in 8s, attempt 4 fails → dead (spec §8.2,
    /// scenario S6). So exhaustion is `attempt > max_retries`, not `>=`.
    pub fn retries_exhausted(&self) -> bool {
        self.attempt > self.max_retries
    }
}

/// A not-yet-enqueued job, as produced by the router when a `projection.update`
/// fan-out occurs (one job per event-type/user per spec §2 "Control flow").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    pub job_type: String,
    pub payload: Payload,
    pub max_retries: i32,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
}

impl NewJob {
    /// Build an immediately-due job with the default retry budget.
    pub fn immediate(user_id: UserId, job_type: impl Into<String>, payload: Payload, now: DateTime<Utc>, max_retries: i32) -> Self {
        Self {
            user_id,
            job_type: job_type.into(),
            payload,
            max_retries,
            priority: 0,
            scheduled_for: now,
        }
    }
}

/// Exponential retry backoff: `2^attempt` seconds (spec §7, §8.2).
///
/// With `max_retries = 3` this produces the schedule 2s, 4s, 8s, then dead —
/// exactly scenario S6.
pub fn retry_backoff_seconds(attempt: i32) -> i64 {
    2i64.saturating_pow(attempt.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_max_retries_three() {
        assert_eq!(retry_backoff_seconds(1), 2);
        assert_eq!(retry_backoff_seconds(2), 4);
        assert_eq!(retry_backoff_seconds(3), 8);
    }
}
