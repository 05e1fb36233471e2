//! Run-level accounting.
//!
//! Every synchronization pass returns a [`SynchronizationResult`]. Partial
//! per-record failures are visible only here (and in logs) — they never
//! propagate as errors past the run boundary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Accumulated accounting for one synchronization pass.
///
/// Results from independent runs (e.g. several maps in one domain) combine
/// with [`merge`](Self::merge), which is pairwise field addition and
/// therefore associative and commutative.
///
/// `target_entries` is a running delta: seeded from the destination's actual
/// count at the start of the run, incremented on add and decremented on
/// delete — never recomputed by re-scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationResult {
    /// Records read from the feed or source scan.
    pub source_entries: u64,
    pub added_entries: u64,
    pub modified_entries: u64,
    pub deleted_entries: u64,
    /// Records that left the destination untouched (no-op diffs,
    /// self-originated changes skipped during replay).
    pub unchanged_entries: u64,
    pub failed_entries: u64,
    /// Destination record count as a running delta (can go negative when
    /// merged results overlap deletions against an unseeded baseline).
    pub target_entries: i64,
    pub duration: Duration,
}

impl SynchronizationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_added(&mut self) {
        self.added_entries += 1;
        self.target_entries += 1;
    }

    pub fn inc_modified(&mut self) {
        self.modified_entries += 1;
    }

    pub fn inc_deleted(&mut self) {
        self.deleted_entries += 1;
        self.target_entries -= 1;
    }

    pub fn inc_unchanged(&mut self) {
        self.unchanged_entries += 1;
    }

    pub fn inc_failed(&mut self) {
        self.failed_entries += 1;
    }

    /// Combine with another run's result by pairwise field addition.
    pub fn merge(&mut self, other: &SynchronizationResult) {
        self.source_entries += other.source_entries;
        self.added_entries += other.added_entries;
        self.modified_entries += other.modified_entries;
        self.deleted_entries += other.deleted_entries;
        self.unchanged_entries += other.unchanged_entries;
        self.failed_entries += other.failed_entries;
        self.target_entries += other.target_entries;
        self.duration += other.duration;
    }

    /// Total records that were examined against the destination.
    pub fn processed_entries(&self) -> u64 {
        self.added_entries
            + self.modified_entries
            + self.deleted_entries
            + self.unchanged_entries
            + self.failed_entries
    }
}

impl fmt::Display for SynchronizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source: {}, added: {}, modified: {}, deleted: {}, unchanged: {}, failed: {}, target: {}, duration: {}ms",
            self.source_entries,
            self.added_entries,
            self.modified_entries,
            self.deleted_entries,
            self.unchanged_entries,
            self.failed_entries,
            self.target_entries,
            self.duration.as_millis()
        )
    }
}
