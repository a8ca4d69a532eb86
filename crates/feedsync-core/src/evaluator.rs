//! Classification of feed groups as synced or unsynced.
//!
//! A group is synced when its `last_sync` parses and lies strictly less than
//! [`FRESHNESS_HOURS`] before `now`. Classification is recomputed from
//! scratch on every poll; nothing is cached between documents.

use std::fmt;

use chrono::{Duration, NaiveDateTime};

use crate::error::Result;
use crate::status::{Group, StatusDocument};
use crate::timestamp::parse_last_sync;

/// Width of the freshness window, in hours.
pub const FRESHNESS_HOURS: i64 = 12;

pub fn freshness_threshold() -> Duration {
    Duration::hours(FRESHNESS_HOURS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedGroup {
    pub name: String,
    pub is_synced: bool,
}

/// Classify one group against `now` (naive UTC).
///
/// A missing `last_sync` is unsynced; an unparseable one is an error.
pub fn classify_group(group: &Group, now: NaiveDateTime) -> Result<ClassifiedGroup> {
    let is_synced = match group.last_sync.as_deref() {
        None => false,
        Some(raw) => now - parse_last_sync(raw)? < freshness_threshold(),
    };
    Ok(ClassifiedGroup {
        name: group.name.clone(),
        is_synced,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: Vec<String>,
    pub unsynced: Vec<String>,
    pub synced_count: usize,
    pub total_count: usize,
}

impl SyncSummary {
    /// Every group is fresh and there is at least one group.
    ///
    /// The engine reports zero groups until its own sync metadata exists, so
    /// an empty document never counts as complete.
    pub fn is_complete(&self) -> bool {
        self.total_count > 0 && self.synced_count == self.total_count
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} groups completed\n\tsynced: {:?}\n\tunsynced: {:?}",
            self.synced_count, self.total_count, self.synced, self.unsynced
        )
    }
}

/// Flatten every group of every record, in order, and classify each one.
/// Duplicate names are kept and counted separately.
pub fn classify(document: &StatusDocument, now: NaiveDateTime) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();
    for group in document.iter().flat_map(|record| record.groups.iter()) {
        let classified = classify_group(group, now)?;
        if classified.is_synced {
            summary.synced_count += 1;
            summary.synced.push(classified.name);
        } else {
            summary.unsynced.push(classified.name);
        }
        summary.total_count += 1;
    }
    Ok(summary)
}
