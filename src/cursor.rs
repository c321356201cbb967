//! Pagination cursor codec.
//!
//! A cursor is `(timestamp, sequence)` serialized as `<RFC3339>:<int>`.
//! The empty string is the zero cursor ("from start"), and `:N` carries a
//! sequence with no timestamp. Splitting happens on the *last* colon so
//! the colons inside the timestamp survive.

use serde::{Deserialize, Serialize};

use crate::clock::parse_rfc3339;
use crate::errors::ToolError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub ts: String,
    pub seq: i64,
}

impl Cursor {
    pub fn zero() -> Self {
        Cursor::default()
    }

    pub fn is_zero(&self) -> bool {
        self.ts.is_empty() && self.seq == 0
    }
}

/// Parse a wire cursor. Empty input yields the zero cursor.
pub fn parse(raw: &str) -> Result<Cursor, ToolError> {
    if raw.is_empty() {
        return Ok(Cursor::zero());
    }
    let (ts, seq_str) = match raw.rfind(':') {
        Some(idx) => (&raw[..idx], &raw[idx + 1..]),
        None => {
            return Err(ToolError::InvalidParam {
                param: "cursor".into(),
                reason: format!("invalid_sequence: missing separator in {raw:?}"),
            })
        }
    };
    if !ts.is_empty() && parse_rfc3339(ts).is_none() {
        return Err(ToolError::InvalidParam {
            param: "cursor".into(),
            reason: format!("invalid_timestamp: {ts:?}"),
        });
    }
    let seq = seq_str.parse::<i64>().map_err(|_| ToolError::InvalidParam {
        param: "cursor".into(),
        reason: format!("invalid_sequence: {seq_str:?}"),
    })?;
    Ok(Cursor {
        ts: ts.to_string(),
        seq,
    })
}

/// Serialize a cursor. Inverse of [`parse`] for all valid inputs.
pub fn build(ts: &str, seq: i64) -> String {
    format!("{ts}:{seq}")
}

/// Ordering predicate deciding whether an entry at `(entry_ts, entry_seq)`
/// lies past the cursor. A timestamped cursor is exclusive (strictly
/// newer, ties on timestamp fall back to sequence); the timestamp-less
/// `:N` form means "from sequence N onward" and is inclusive.
pub fn is_newer(entry_ts: &str, entry_seq: i64, cursor: &Cursor) -> bool {
    if cursor.ts.is_empty() {
        return entry_seq >= cursor.seq;
    }
    match (parse_rfc3339(entry_ts), parse_rfc3339(&cursor.ts)) {
        (Some(a), Some(b)) => a > b || (a == b && entry_seq > cursor.seq),
        // Unparseable timestamps fall back to lexical order so a corrupt
        // entry cannot wedge pagination.
        _ => entry_ts > cursor.ts.as_str() || (entry_ts == cursor.ts && entry_seq > cursor.seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parses_to_zero() {
        let c = parse("").unwrap();
        assert!(c.is_zero());
    }

    #[test]
    fn round_trip_samples() {
        for (ts, seq) in [
            ("", 1234),
            ("2026-01-30T10:15:23Z", 1234),
            ("2026-01-30T10:15:23.456789Z", 5678),
            ("2026-01-30T10:15:23.000000001Z", 0),
        ] {
            let wire = build(ts, seq);
            let parsed = parse(&wire).unwrap();
            assert_eq!(parsed.ts, ts);
            assert_eq!(parsed.seq, seq);
        }
    }

    #[test]
    fn sequence_only_form() {
        let c = parse(":1234").unwrap();
        assert_eq!(c.ts, "");
        assert_eq!(c.seq, 1234);
    }

    #[test]
    fn zero_build_round_trips() {
        let c = parse(&build("", 0)).unwrap();
        assert!(c.is_zero());
    }

    #[test]
    fn rejects_bad_timestamp_and_sequence() {
        assert!(parse("yesterday:5").is_err());
        assert!(parse("2026-01-30T10:15:23Z:five").is_err());
        assert!(parse("noseparator").is_err());
    }

    #[test]
    fn sequence_only_cursor_is_inclusive() {
        let c = parse(":2").unwrap();
        assert!(!is_newer("2026-01-30T10:15:23Z", 1, &c));
        assert!(is_newer("2026-01-30T10:15:23Z", 2, &c));
        assert!(is_newer("2026-01-30T10:15:24Z", 3, &c));
    }

    #[test]
    fn ordering_prefers_timestamp_then_sequence() {
        let c = parse("2026-01-30T10:15:23Z:2").unwrap();
        assert!(is_newer("2026-01-30T10:15:24Z", 1, &c));
        assert!(is_newer("2026-01-30T10:15:23Z", 3, &c));
        assert!(!is_newer("2026-01-30T10:15:23Z", 2, &c));
        assert!(!is_newer("2026-01-30T10:15:22Z", 9, &c));
    }

    #[test]
    fn ordering_handles_mixed_precision() {
        let c = parse("2026-01-30T10:15:23.456789Z:5").unwrap();
        assert!(is_newer("2026-01-30T10:15:24Z", 1, &c));
        assert!(!is_newer("2026-01-30T10:15:23Z", 9, &c));
    }

    #[test]
    fn zero_cursor_admits_everything() {
        let c = Cursor::zero();
        assert!(is_newer("2026-01-30T10:15:23Z", 0, &c));
    }
}
