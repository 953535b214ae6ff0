//! Timestamp normalization.
//!
//! Everything is stored and compared as epoch milliseconds. Callers at the
//! HTTP boundary may send either a number of milliseconds or an ISO-8601
//! string; both end up as a `DateTime<Utc>` here.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::error::{Result, TextcastError};

/// Convert epoch milliseconds to a UTC timestamp.
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| TextcastError::InvalidInput(format!("timestamp out of range: {ms}")))
}

/// Same as [`from_millis`] for values read back from storage, where a bad
/// value can only mean a corrupted row. Falls back to the epoch.
pub fn from_millis_lossy(ms: i64) -> DateTime<Utc> {
    from_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parse a timestamp given as a string: ISO-8601/RFC 3339, a bare date
/// (midnight UTC), or a string of digits holding epoch milliseconds.
pub fn parse_str(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TextcastError::InvalidInput("empty timestamp".into()));
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        let ms: i64 = raw
            .parse()
            .map_err(|e| TextcastError::InvalidInput(format!("bad epoch millis '{raw}': {e}")))?;
        return from_millis(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    // ISO-8601 without an offset is read as UTC
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
    }
    Err(TextcastError::InvalidInput(format!(
        "unrecognized timestamp '{raw}' (expected epoch millis or ISO-8601)"
    )))
}

/// Parse a JSON timestamp value: integer/float epoch millis or a string.
pub fn parse_value(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => {
            let ms = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| TextcastError::InvalidInput(format!("bad timestamp {n}")))?;
            from_millis(ms)
        }
        serde_json::Value::String(s) => parse_str(s),
        other => Err(TextcastError::InvalidInput(format!(
            "timestamp must be a number or string, got {other}"
        ))),
    }
}

/// Parse an optional JSON timestamp, treating `null`/missing as `None`.
pub fn parse_optional(value: Option<&serde_json::Value>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => parse_value(v).map(Some),
    }
}

/// Midnight UTC of the day containing `at`.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
}
