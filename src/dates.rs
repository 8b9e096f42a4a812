use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::unique::OpError;

/// Collapse a date-valued natural-key field to the start of its calendar
/// day, so two submissions for the same day collide regardless of
/// time-of-day noise. Accepts `YYYY-MM-DD`, a naive datetime, or an
/// RFC 3339 timestamp; returns the canonical `YYYY-MM-DD` form.
///
/// Invoked explicitly by handlers before any duplicate query or write
/// that touches a date key — never as an implicit lifecycle hook.
pub fn normalize_day_start(input: &str) -> Result<String, OpError> {
    let t = input.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.date().format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    Err(OpError::InvalidArgument(format!(
        "date must be YYYY-MM-DD or an RFC 3339 datetime, got {:?}",
        input
    )))
}
