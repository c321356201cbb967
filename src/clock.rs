//! Wall-clock formatting and timestamp normalization.
//!
//! All timestamps on the wire are RFC3339 with nanosecond precision in
//! UTC. Telemetry producers are sloppy about formats, so ingestion
//! normalizes strings, integer epoch milliseconds and float epoch
//! milliseconds into the canonical form.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::errors::ToolError;

/// Current wall time as an RFC3339 string with nanosecond precision.
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC3339 timestamp (any fractional precision, offset allowed)
/// into UTC. Used by the cursor ordering predicate.
pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Normalize a caller-supplied timestamp value into RFC3339.
///
/// Strings pass through after a parse check; integers are interpreted as
/// Unix epoch milliseconds and rendered at second precision; floats are
/// treated the same way after truncation.
pub fn normalize_timestamp(value: &Value) -> Result<String, ToolError> {
    match value {
        Value::String(s) => {
            if s.is_empty() {
                return Ok(String::new());
            }
            parse_rfc3339(s).ok_or_else(|| ToolError::InvalidParam {
                param: "timestamp".into(),
                reason: format!("not an RFC3339 timestamp: {s}"),
            })?;
            Ok(s.clone())
        }
        Value::Number(n) => {
            let millis = if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                f as i64
            } else {
                return Err(invalid_timestamp(n.to_string()));
            };
            let dt = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| invalid_timestamp(millis.to_string()))?;
            Ok(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        other => Err(invalid_timestamp(other.to_string())),
    }
}

fn invalid_timestamp(got: String) -> ToolError {
    ToolError::InvalidParam {
        param: "timestamp".into(),
        reason: format!("invalid_timestamp: {got}"),
    }
}

/// Opaque correlation id: family prefix plus a hyphenless v4 UUID.
pub fn correlation_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nanos_format_has_nine_fraction_digits() {
        let ts = now_rfc3339_nanos();
        let frac = ts.split('.').nth(1).expect("fractional part");
        assert_eq!(frac.len(), 9 + 1); // nine digits plus trailing Z
        assert!(frac.ends_with('Z'));
        assert!(parse_rfc3339(&ts).is_some());
    }

    #[test]
    fn normalize_passes_strings_through() {
        let ts = "2026-01-30T10:15:23.456789Z";
        assert_eq!(normalize_timestamp(&json!(ts)).unwrap(), ts);
    }

    #[test]
    fn normalize_converts_epoch_millis() {
        let out = normalize_timestamp(&json!(1_769_768_123_000i64)).unwrap();
        assert!(out.ends_with('Z'));
        assert_eq!(parse_rfc3339(&out).unwrap().timestamp(), 1_769_768_123);
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_timestamp(&json!("not a time")).is_err());
        assert!(normalize_timestamp(&json!(true)).is_err());
    }

    #[test]
    fn correlation_ids_are_unique_and_prefixed() {
        let a = correlation_id("nav_");
        let b = correlation_id("nav_");
        assert!(a.starts_with("nav_"));
        assert_ne!(a, b);
    }
}
