use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current instant in UTC.
pub fn current_utc_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Formats a UTC instant the way tick timestamps are logged, with microsecond
/// precision and an explicit offset, e.g. `2024-05-01T12:00:00.123456+00:00`.
pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}
