//! Timestamp handling for translated headers.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

/// NServiceBus wire format (`yyyy-MM-dd HH:mm:ss:ffffff Z`).
pub const WIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S:%6f Z";

/// Render a timestamp the way NServiceBus writes it.
pub fn to_wire_format(timestamp: DateTime<Utc>) -> String {
    timestamp.format(WIRE_FORMAT).to_string()
}

/// Parse a timestamp written by MassTransit (ISO 8601) or already in
/// wire format. Values without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    [WIRE_FORMAT, "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Render a duration as a .NET `TimeSpan` (`[d.]hh:mm:ss[.fffffff]`).
///
/// Negative durations are clamped to zero.
pub fn to_timespan(duration: TimeDelta) -> String {
    let duration = duration.max(TimeDelta::zero());
    let total_secs = duration.num_seconds();
    let ticks = duration.subsec_nanos() / 100;

    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut rendered = String::new();
    if days > 0 {
        rendered.push_str(&format!("{}.", days));
    }
    rendered.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    if ticks > 0 {
        rendered.push_str(&format!(".{:07}", ticks));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
            + TimeDelta::microseconds(42);
        assert_eq!(to_wire_format(ts), "2024-03-05 14:07:09:000042 Z");
    }

    #[test]
    fn test_parse_iso_with_offset() {
        let parsed = parse_timestamp("2024-03-05T16:07:09.1234567+02:00").unwrap();
        assert_eq!(to_wire_format(parsed), "2024-03-05 14:07:09:123456 Z");
    }

    #[test]
    fn test_parse_without_offset_is_utc() {
        let parsed = parse_timestamp("2024-03-05T14:07:09").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap());
    }

    #[test]
    fn test_parse_wire_format_round_trips() {
        let wire = "2024-03-05 14:07:09:000042 Z";
        assert_eq!(to_wire_format(parse_timestamp(wire).unwrap()), wire);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_timespan() {
        assert_eq!(to_timespan(TimeDelta::seconds(90)), "00:01:30");
        assert_eq!(
            to_timespan(TimeDelta::days(2) + TimeDelta::hours(3)),
            "2.03:00:00"
        );
        assert_eq!(to_timespan(TimeDelta::milliseconds(1500)), "00:00:01.5000000");
        assert_eq!(to_timespan(TimeDelta::seconds(-5)), "00:00:00");
    }
}
