//! Tolerant parsing of the `last_sync` field reported by the engine.
//!
//! The engine is assumed to report UTC. Any offset suffix is stripped rather
//! than applied, and fractional seconds are dropped, so every accepted value
//! becomes a naive UTC datetime with whole-second precision.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Timelike};
use regex::Regex;

use crate::error::{FeedSyncError, Result};

const BASE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

static PREFIX_RE: OnceLock<Regex> = OnceLock::new();

/// `YYYY-MM-DDTHH:MM:S{1,2}` anywhere in the string.
fn prefix_re() -> &'static Regex {
    PREFIX_RE.get_or_init(|| {
        Regex::new(r"([0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{1,2})").unwrap()
    })
}

/// Parse a `last_sync` value into naive UTC.
///
/// Tries a strict ISO-8601/RFC 3339 parse first, then falls back to the
/// leading date-time pattern. Fails with [`FeedSyncError::MalformedTimestamp`]
/// when neither matches.
pub fn parse_last_sync(raw: &str) -> Result<NaiveDateTime> {
    strict(raw)
        .or_else(|| fallback(raw))
        .ok_or_else(|| FeedSyncError::MalformedTimestamp(raw.to_string()))
}

fn strict(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, BASE_FORMAT) {
        return Some(naive);
    }
    // naive_local() keeps the wall-clock digits as written: the offset is
    // discarded, not converted.
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| dt.naive_local().with_nanosecond(0))
}

fn fallback(raw: &str) -> Option<NaiveDateTime> {
    let caps = prefix_re().captures(raw)?;
    NaiveDateTime::parse_from_str(&caps[1], BASE_FORMAT).ok()
}
