use anyhow::{Context, Result};
use time::{format_description::well_known, OffsetDateTime, UtcOffset, Weekday};

use crate::model::Timestamp;

/// Converts a unix timestamp into a date-time at the given offset.
pub fn to_local(timestamp: Timestamp, offset: UtcOffset) -> Result<OffsetDateTime> {
    let utc = OffsetDateTime::from_unix_timestamp(timestamp)
        .with_context(|| format!("Timestamp {timestamp} is out of range"))?;
    Ok(utc.to_offset(offset))
}

pub fn is_weekend(date: &OffsetDateTime) -> bool {
    matches!(date.weekday(), Weekday::Saturday | Weekday::Sunday)
}

/// The calendar date at the given offset as YYYY-MM-DD.
pub fn local_date(timestamp: Timestamp, offset: UtcOffset) -> Result<String> {
    Ok(to_local(timestamp, offset)?.date().to_string())
}

/// RFC 3339 rendering of a timestamp, in UTC. Out of range
/// timestamps are rendered as the raw number.
pub fn format_utc(timestamp: Timestamp) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|d| d.format(&well_known::Rfc3339).ok())
        .unwrap_or_else(|| timestamp.to_string())
}
