//! Fallback session-key assignment for `set.logged` events with no explicit
//! `metadata.session_id` (spec §3.2 "Session attribution", §8.2, §9 Open
//! Question).
//!
//! The original's `next_fallback_session_key` / overnight-boundary state
//! machine lives in a `utils` module that was not part of the retrieved
//! source (see DESIGN.md). This implements a self-consistent fallback
//! documented there: a training day runs from 04:00 local time to the next
//! day's 04:00, so a late-night set and the following morning's sets before
//! 04:00 still land on the prior training day rather than splitting a single
//! overnight session in two.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

const OVERNIGHT_BOUNDARY_HOUR: u32 = 4;

/// The fallback session key for a set logged at `timestamp` (UTC) in the
/// user's `timezone`. Explicit `metadata.session_id` always takes priority
/// over this; callers only reach here when it is absent (spec §3.2).
pub fn fallback_session_key(timestamp: DateTime<Utc>, timezone: Tz) -> String {
    let local = timestamp.with_timezone(&timezone);
    let training_day = training_day_for(local.naive_local().date(), local.hour());
    format!("fallback:{}", training_day.format("%Y-%m-%d"))
}

fn training_day_for(date: NaiveDate, local_hour: u32) -> NaiveDate {
    if local_hour < OVERNIGHT_BOUNDARY_HOUR {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Group a chronologically-sorted slice of `(timestamp, index)` pairs into
/// fallback sessions, returning the session key per input index in order.
pub fn assign_fallback_sessions(timestamps: &[DateTime<Utc>], timezone: Tz) -> Vec<String> {
    timestamps.iter().map(|ts| fallback_session_key(*ts, timezone)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn late_night_and_early_morning_sets_share_a_training_day() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let late_night = tz.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap().with_timezone(&Utc);
        let early_morning = tz.with_ymd_and_hms(2026, 3, 11, 1, 15, 0).unwrap().with_timezone(&Utc);

        assert_eq!(fallback_session_key(late_night, tz), fallback_session_key(early_morning, tz));
    }

    #[test]
    fn afternoon_sets_on_different_days_differ() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let day1 = tz.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap().with_timezone(&Utc);
        let day2 = tz.with_ymd_and_hms(2026, 3, 11, 15, 0, 0).unwrap().with_timezone(&Utc);

        assert_ne!(fallback_session_key(day1, tz), fallback_session_key(day2, tz));
    }
}
