//! Hour-granularity time buckets.

use chrono::{DateTime, FixedOffset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECS_PER_HOUR: i64 = 3600;

/// A UTC date-hour, stored as hours since the Unix epoch.
///
/// Displays as `YYYY-MM-DDTHH`, which is also its storage-key form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HourBucket(i64);

impl HourBucket {
    /// The bucket containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self(at.timestamp().div_euclid(SECS_PER_HOUR))
    }

    /// Hours since the Unix epoch.
    pub fn hours_since_epoch(&self) -> i64 {
        self.0
    }

    /// First instant of the bucket.
    pub fn start(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0 * SECS_PER_HOUR, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The bucket `hours` before this one.
    pub fn minus_hours(&self, hours: i64) -> Self {
        Self(self.0 - hours)
    }

    /// The preceding bucket.
    pub fn previous(&self) -> Self {
        self.minus_hours(1)
    }
}

impl fmt::Display for HourBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start().format("%Y-%m-%dT%H"))
    }
}

/// Local wall-clock hour of `at` under a fixed UTC offset in minutes.
///
/// Offsets outside ±24h fall back to UTC.
pub fn local_hour(at: DateTime<Utc>, utc_offset_minutes: i32) -> u32 {
    match FixedOffset::east_opt(utc_offset_minutes * 60) {
        Some(offset) => at.with_timezone(&offset).hour(),
        None => at.hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_date_hour() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 13, 59, 59).unwrap();
        assert_eq!(HourBucket::containing(at).to_string(), "2024-03-01T13");
    }

    #[test]
    fn test_previous_crosses_midnight() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 10, 0).unwrap();
        assert_eq!(HourBucket::containing(at).previous().to_string(), "2024-02-29T23");
        assert_eq!(HourBucket::containing(at).minus_hours(48).to_string(), "2024-02-28T00");
    }

    #[test]
    fn test_containing_is_stable_within_hour() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 1, 7, 59, 59).unwrap();
        assert_eq!(HourBucket::containing(a), HourBucket::containing(b));
        assert_eq!(HourBucket::containing(a).start(), a);
    }

    #[test]
    fn test_local_hour_applies_offset() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(local_hour(at, 0), 3);
        assert_eq!(local_hour(at, 9 * 60), 12);
        assert_eq!(local_hour(at, -5 * 60), 22);
    }
}
