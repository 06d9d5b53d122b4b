//! Next-run calculations for scheduled tasks. All times are UTC.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

fn next_past_the_hour(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let hour = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
    let candidate = hour + TimeDelta::minutes(minutes);
    if candidate < now {
        candidate + TimeDelta::hours(1)
    } else {
        candidate
    }
}

/// The next `hh:15:00` at or after `now`.
#[must_use]
pub fn quarter_past_each_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    next_past_the_hour(now, 15)
}

/// The next `hh:45:00` at or after `now`.
#[must_use]
pub fn quarter_to_each_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    next_past_the_hour(now, 45)
}

/// The next `03:00:00` at or after `now`.
#[must_use]
pub fn three_am(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now
        .date_naive()
        .and_hms_opt(3, 0, 0)
        .map_or(now, |time| time.and_utc());
    if candidate < now {
        candidate + TimeDelta::days(1)
    } else {
        candidate
    }
}
