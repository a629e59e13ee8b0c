//! Quota period resolution.
//!
//! A [`Period`] is the `[start, end)` window usage is counted against.
//! Calendar quotas align `start` to the natural boundary of the time unit
//! (top of the hour, midnight, preceding Monday, first of the month) at or
//! before "now"; rolling-window quotas always end at "now" and reach back
//! `interval` units. Month arithmetic is calendar arithmetic
//! ([`chrono::Months`]), never a fixed duration.
//!
//! Unrecognized unit/type strings are rejected when parsing into the typed
//! enums, so [`resolve`] itself cannot fail; a window that overflows the
//! representable time range comes back degenerate and is caught by
//! [`Period::validate`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};

use crate::error::QuotaError;

/// Granularity of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = QuotaError;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(QuotaError::InvalidTimeUnit(other.to_string())),
        }
    }
}

/// How the window slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaType {
    /// Aligned to natural time boundaries; stable until it expires.
    Calendar,
    /// Fixed length ending at the current instant, sliding continuously.
    RollingWindow,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::RollingWindow => "rollingwindow",
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "calendar" => Ok(Self::Calendar),
            "rollingwindow" => Ok(Self::RollingWindow),
            other => Err(QuotaError::InvalidQuotaType(other.to_string())),
        }
    }
}

/// The currently active `[start, end)` counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    /// The tenant-supplied reference instant; copied from the bucket's
    /// start time and never changed by re-resolution.
    pub input_start: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// Reject windows where `start >= end`.
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.start < self.end {
            Ok(())
        } else {
            Err(QuotaError::InvalidPeriod {
                start: self.start.timestamp(),
                end: self.end.timestamp(),
            })
        }
    }

    /// Whether this period is active at `now` for the given quota type.
    ///
    /// Rolling windows are current by construction once the quota's input
    /// start time has passed; calendar windows additionally require
    /// `start <= now < end`.
    pub fn is_current(&self, quota_type: QuotaType, now: DateTime<Utc>) -> bool {
        if self.input_start > now {
            return false;
        }
        match quota_type {
            QuotaType::RollingWindow => true,
            QuotaType::Calendar => self.start <= now && now < self.end,
        }
    }

    /// Window start as epoch seconds.
    pub fn start_timestamp(&self) -> i64 {
        self.start.timestamp()
    }

    /// Window end as epoch seconds.
    pub fn expires_timestamp(&self) -> i64 {
        self.end.timestamp()
    }

    /// Whether the window has expired relative to `now`. Always false for a
    /// window still covering `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }
}

/// Compute the active period for a quota at `now`.
///
/// `input_start` is carried through untouched. `interval` is
/// caller-controlled, so all window arithmetic is checked: a window that
/// cannot be represented comes back degenerate and fails
/// [`Period::validate`].
pub fn resolve(
    quota_type: QuotaType,
    time_unit: TimeUnit,
    interval: u32,
    input_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Period {
    let (start, end) = match quota_type {
        QuotaType::Calendar => calendar_window(time_unit, interval, now),
        QuotaType::RollingWindow => rolling_window(time_unit, interval, now),
    };
    Period { input_start, start, end }
}

fn calendar_window(unit: TimeUnit, interval: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let n = i64::from(interval);
    let (start, length) = match unit {
        TimeUnit::Second => (truncate_to_second(now), Duration::seconds(n)),
        TimeUnit::Minute => (
            truncate_to_second(now) - Duration::seconds(i64::from(now.second())),
            Duration::minutes(n),
        ),
        TimeUnit::Hour => (
            truncate_to_second(now)
                - Duration::seconds(i64::from(now.second()))
                - Duration::minutes(i64::from(now.minute())),
            Duration::hours(n),
        ),
        TimeUnit::Day => (midnight(now), Duration::days(n)),
        TimeUnit::Week => {
            let midnight = midnight(now);
            let start =
                midnight - Duration::days(i64::from(midnight.weekday().num_days_from_monday()));
            (start, Duration::weeks(n))
        }
        TimeUnit::Month => {
            let start = midnight(now) - Duration::days(i64::from(now.day()) - 1);
            // Overflow leaves end == start; validate() rejects the window.
            let end = start.checked_add_months(Months::new(interval)).unwrap_or(start);
            return (start, end);
        }
    };
    // Overflow leaves end == start; validate() rejects the window.
    let end = start.checked_add_signed(length).unwrap_or(start);
    (start, end)
}

fn rolling_window(unit: TimeUnit, interval: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let n = i64::from(interval);
    let start = match unit {
        TimeUnit::Second => now.checked_sub_signed(Duration::seconds(n)),
        TimeUnit::Minute => now.checked_sub_signed(Duration::minutes(n)),
        TimeUnit::Hour => now.checked_sub_signed(Duration::hours(n)),
        TimeUnit::Day => now.checked_sub_signed(Duration::days(n)),
        TimeUnit::Week => now.checked_sub_signed(Duration::weeks(n)),
        // Window length matches the calendar months it spans.
        TimeUnit::Month => now.checked_sub_months(Months::new(interval)),
    };
    // Overflow leaves start == end; validate() rejects the window.
    (start.unwrap_or(now), now)
}

fn truncate_to_second(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::nanoseconds(i64::from(now.nanosecond()))
}

fn midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_second(now)
        - Duration::seconds(i64::from(now.second()))
        - Duration::minutes(i64::from(now.minute()))
        - Duration::hours(i64::from(now.hour()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("valid rfc3339").with_timezone(&Utc)
    }

    #[test]
    fn parses_time_units_case_insensitively() {
        assert_eq!("  HOUR ".parse::<TimeUnit>().unwrap(), TimeUnit::Hour);
        assert_eq!("minute".parse::<TimeUnit>().unwrap(), TimeUnit::Minute);
        assert!(matches!(
            "fortnight".parse::<TimeUnit>(),
            Err(QuotaError::InvalidTimeUnit(u)) if u == "fortnight"
        ));
    }

    #[test]
    fn parses_quota_types() {
        assert_eq!("Calendar".parse::<QuotaType>().unwrap(), QuotaType::Calendar);
        assert_eq!("ROLLINGWINDOW".parse::<QuotaType>().unwrap(), QuotaType::RollingWindow);
        assert!("flexi".parse::<QuotaType>().is_err());
    }

    #[test]
    fn calendar_hour_aligns_to_top_of_hour() {
        let now = at("2024-03-15T10:42:31.5Z");
        let input = at("2024-01-01T00:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Hour, 1, input, now);
        assert_eq!(p.start, at("2024-03-15T10:00:00Z"));
        assert_eq!(p.end, at("2024-03-15T11:00:00Z"));
        assert_eq!(p.input_start, input);
        assert!(p.is_current(QuotaType::Calendar, now));
    }

    #[test]
    fn calendar_minute_and_second_truncate() {
        let now = at("2024-03-15T10:42:31.25Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Minute, 5, now, now);
        assert_eq!(p.start, at("2024-03-15T10:42:00Z"));
        assert_eq!(p.end, at("2024-03-15T10:47:00Z"));

        let p = resolve(QuotaType::Calendar, TimeUnit::Second, 30, now, now);
        assert_eq!(p.start, at("2024-03-15T10:42:31Z"));
        assert_eq!(p.end, at("2024-03-15T10:43:01Z"));
    }

    #[test]
    fn calendar_day_starts_at_midnight_utc() {
        let now = at("2024-03-15T23:59:59Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Day, 2, now, now);
        assert_eq!(p.start, at("2024-03-15T00:00:00Z"));
        assert_eq!(p.end, at("2024-03-17T00:00:00Z"));
    }

    #[test]
    fn calendar_week_starts_on_preceding_monday() {
        // 2024-03-15 is a Friday; the preceding Monday is 2024-03-11.
        let now = at("2024-03-15T10:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Week, 1, now, now);
        assert_eq!(p.start, at("2024-03-11T00:00:00Z"));
        assert_eq!(p.end, at("2024-03-18T00:00:00Z"));

        // A Monday stays put.
        let monday = at("2024-03-11T08:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Week, 1, monday, monday);
        assert_eq!(p.start, at("2024-03-11T00:00:00Z"));
    }

    #[test]
    fn calendar_month_uses_variable_length_months() {
        // February 2024 is a leap month: 29 days.
        let now = at("2024-02-10T12:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Month, 1, now, now);
        assert_eq!(p.start, at("2024-02-01T00:00:00Z"));
        assert_eq!(p.end, at("2024-03-01T00:00:00Z"));
        assert_eq!((p.end - p.start).num_days(), 29);

        let now = at("2024-01-31T12:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Month, 2, now, now);
        assert_eq!(p.start, at("2024-01-01T00:00:00Z"));
        assert_eq!(p.end, at("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn calendar_window_always_covers_now() {
        let now = at("2024-03-15T10:42:31Z");
        for unit in [
            TimeUnit::Second,
            TimeUnit::Minute,
            TimeUnit::Hour,
            TimeUnit::Day,
            TimeUnit::Week,
            TimeUnit::Month,
        ] {
            let p = resolve(QuotaType::Calendar, unit, 1, now, now);
            assert!(p.start <= now && now < p.end, "unit {unit} window {p:?}");
            p.validate().expect("valid window");
        }
    }

    #[test]
    fn rolling_window_ends_at_now() {
        let now = at("2024-03-15T10:42:31Z");
        let p = resolve(QuotaType::RollingWindow, TimeUnit::Hour, 3, now, now);
        assert_eq!(p.end, now);
        assert_eq!(p.start, at("2024-03-15T07:42:31Z"));
        assert!(p.is_current(QuotaType::RollingWindow, now));
    }

    #[test]
    fn rolling_month_spans_calendar_months() {
        // One month back from March 31 lands on Feb 29 in a leap year.
        let now = at("2024-03-31T10:00:00Z");
        let p = resolve(QuotaType::RollingWindow, TimeUnit::Month, 1, now, now);
        assert_eq!(p.start, at("2024-02-29T10:00:00Z"));
        assert_eq!(p.end, now);
    }

    #[test]
    fn oversized_interval_degenerates_instead_of_panicking() {
        let now = at("2024-03-15T10:42:31Z");
        // Hour and coarser overflow chrono's representable range at
        // u32::MAX; the degenerate window must be rejected, never a panic.
        for unit in [TimeUnit::Hour, TimeUnit::Day, TimeUnit::Week, TimeUnit::Month] {
            let p = resolve(QuotaType::Calendar, unit, u32::MAX, now, now);
            assert!(
                matches!(p.validate(), Err(QuotaError::InvalidPeriod { .. })),
                "calendar {unit} accepted {p:?}"
            );
            let p = resolve(QuotaType::RollingWindow, unit, u32::MAX, now, now);
            assert!(
                matches!(p.validate(), Err(QuotaError::InvalidPeriod { .. })),
                "rolling {unit} accepted {p:?}"
            );
        }
        // u32::MAX seconds (~136 years) still fits; the window stays valid.
        let p = resolve(QuotaType::Calendar, TimeUnit::Second, u32::MAX, now, now);
        p.validate().expect("representable window");
        assert!(p.is_current(QuotaType::Calendar, now));
    }

    #[test]
    fn validate_rejects_inverted_period() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let p = Period { input_start: now, start: now, end: now };
        assert!(matches!(p.validate(), Err(QuotaError::InvalidPeriod { .. })));

        let p = Period { input_start: now, start: now, end: now - Duration::seconds(1) };
        assert!(p.validate().is_err());
    }

    #[test]
    fn future_input_start_is_not_current() {
        let now = at("2024-03-15T10:00:00Z");
        let future = at("2025-01-01T00:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Hour, 1, future, now);
        assert!(!p.is_current(QuotaType::Calendar, now));
        let p = resolve(QuotaType::RollingWindow, TimeUnit::Hour, 1, future, now);
        assert!(!p.is_current(QuotaType::RollingWindow, now));
    }

    #[test]
    fn expiry_tracks_end_bound() {
        let now = at("2024-03-15T10:00:00Z");
        let p = resolve(QuotaType::Calendar, TimeUnit::Hour, 1, now, now);
        assert!(!p.is_expired(now));
        assert!(p.is_expired(at("2024-03-15T11:00:00Z")));
    }
}
