//! Time-string input parsing shared by every query filter.
//!
//! Accepted forms: unix seconds, shorthand durations ("90m", "2d"),
//! humanized relative ("3 days ago"), and ISO-8601 dates or datetimes.
//! Everything normalizes to a UTC ISO-8601 string with a trailing `Z`;
//! comparisons elsewhere always go through `chrono`, never raw strings.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Unix timestamps below this (2000-01-01) are rejected as ambiguous.
const MIN_UNIX_SECONDS: i64 = 946_684_800;

static SHORTHAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(s|m|h|d|w|mo|y)$").unwrap());

static HUMANIZED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*(second|minute|hour|day|week|month|year)s?\s+ago$").unwrap()
});

/// Parse one of the accepted time-input forms relative to `now`.
pub fn parse_time_input(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<i64>() {
        if secs >= MIN_UNIX_SECONDS {
            return Utc.timestamp_opt(secs, 0).single();
        }
        return None;
    }

    if let Some(caps) = SHORTHAND_RE.captures(s) {
        let n: i64 = caps[1].parse().ok()?;
        let dur = match &caps[2] {
            "s" => Duration::seconds(n),
            "m" => Duration::minutes(n),
            "h" => Duration::hours(n),
            "d" => Duration::days(n),
            "w" => Duration::weeks(n),
            "mo" => Duration::days(n * 30),
            "y" => Duration::days(n * 365),
            _ => return None,
        };
        return Some(now - dur);
    }

    if let Some(caps) = HUMANIZED_RE.captures(&s.to_lowercase()) {
        let n: i64 = caps[1].parse().ok()?;
        let dur = match &caps[2] {
            "second" => Duration::seconds(n),
            "minute" => Duration::minutes(n),
            "hour" => Duration::hours(n),
            "day" => Duration::days(n),
            "week" => Duration::weeks(n),
            "month" => Duration::days(n * 30),
            "year" => Duration::days(n * 365),
            _ => return None,
        };
        return Some(now - dur);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Datetime without timezone marker: assume UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }

    None
}

/// Parse an input and render it as the store's canonical UTC ISO-8601 form.
pub fn parse_to_rfc3339(input: &str, now: DateTime<Utc>) -> Option<String> {
    parse_time_input(input, now).map(|dt| to_rfc3339_z(&dt))
}

/// Canonical UTC ISO-8601 rendering with `Z`, second precision.
pub fn to_rfc3339_z(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
///
/// Stored values always carry a timezone, but source timestamps flow through
/// here too, so the no-timezone fallback mirrors `parse_time_input`.
pub fn parse_stored(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(ts, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Normalize an arbitrary source timestamp to the canonical stored form.
/// Inputs missing a timezone marker are treated as UTC.
pub fn normalize_source_ts(ts: &str) -> Option<String> {
    parse_stored(ts).map(|dt| to_rfc3339_z(&dt))
}

/// Millisecond unix timestamp to canonical stored form.
pub fn ms_to_rfc3339(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms).single().map(|dt| to_rfc3339_z(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_unix_seconds() {
        let dt = parse_time_input("1700000000", now()).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rejects_small_integers() {
        assert!(parse_time_input("42", now()).is_none());
    }

    #[test]
    fn parses_shorthand_durations() {
        assert_eq!(
            parse_time_input("2h", now()).unwrap(),
            now() - Duration::hours(2)
        );
        assert_eq!(
            parse_time_input("3mo", now()).unwrap(),
            now() - Duration::days(90)
        );
    }

    #[test]
    fn parses_humanized_relative() {
        assert_eq!(
            parse_time_input("3 days ago", now()).unwrap(),
            now() - Duration::days(3)
        );
        assert_eq!(
            parse_time_input("1 week ago", now()).unwrap(),
            now() - Duration::weeks(1)
        );
    }

    #[test]
    fn parses_iso_date_and_datetime() {
        let d = parse_time_input("2025-01-02", now()).unwrap();
        assert_eq!(to_rfc3339_z(&d), "2025-01-02T00:00:00.000Z");

        // No timezone marker: assumed UTC.
        let dt = parse_time_input("2025-01-02T03:04:05", now()).unwrap();
        assert_eq!(dt.timestamp(), 1_735_787_045);

        // Explicit offset is honored.
        let dt = parse_time_input("2025-01-02T03:04:05+02:00", now()).unwrap();
        assert_eq!(to_rfc3339_z(&dt), "2025-01-02T01:04:05.000Z");
    }

    #[test]
    fn normalizes_source_timestamps() {
        assert_eq!(
            normalize_source_ts("2025-01-02T03:04:05").unwrap(),
            "2025-01-02T03:04:05.000Z"
        );
        assert_eq!(
            normalize_source_ts("2025-01-02T03:04:05.123Z").unwrap(),
            "2025-01-02T03:04:05.123Z"
        );
    }
}
