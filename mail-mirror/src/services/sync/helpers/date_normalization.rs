use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::error::{MirrorError, Result};

/// Fixed-width UTC form; lexical order equals chronological order
pub const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_canonical(dt: DateTime<Utc>) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// Normalize a provider timestamp to the canonical form.
///
/// Accepts RFC 3339, RFC 2822 (mail `Date:` headers), epoch seconds or
/// milliseconds, and naive `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn normalize_received_on(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(MirrorError::DateNormalization("empty timestamp".into()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(format_canonical(dt.with_timezone(&Utc)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Ok(format_canonical(dt.with_timezone(&Utc)));
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let value: i64 = raw
            .parse()
            .map_err(|e| MirrorError::DateNormalization(format!("{}: {}", raw, e)))?;
        // 13+ digits is milliseconds (anything after 2001-09-09)
        let parsed = if raw.len() >= 13 {
            Utc.timestamp_millis_opt(value).single()
        } else {
            Utc.timestamp_opt(value, 0).single()
        };
        return parsed
            .map(format_canonical)
            .ok_or_else(|| MirrorError::DateNormalization(format!("out of range: {}", raw)));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(format_canonical(Utc.from_utc_datetime(&naive)));
    }

    Err(MirrorError::DateNormalization(format!(
        "unrecognized timestamp: {}",
        raw
    )))
}

/// Like [`normalize_received_on`] but falls back to the current time
pub fn normalize_or_now(thread_id: &str, raw: &str) -> String {
    match normalize_received_on(raw) {
        Ok(normalized) => normalized,
        Err(e) => {
            warn!("Thread {}: {}, using current time", thread_id, e);
            format_canonical(Utc::now())
        }
    }
}
