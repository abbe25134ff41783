//! Value timestamps: ISO-8601, millisecond precision, explicit offset.

use chrono::{DateTime, FixedOffset, Local};

/// Wire format, e.g. `2024-03-05T10:11:12.345+01:00`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

pub type Timestamp = DateTime<FixedOffset>;

/// Current local time with its offset.
pub fn now() -> Timestamp {
    Local::now().fixed_offset()
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Lenient parse: accepts anything RFC 3339 accepts, including `Z`.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, TIMESTAMP_FORMAT))
        .ok()
}
