// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed strategies.
//!
//! A [`ChangeFeed`] turns a source's native change-tracking mechanism into an
//! ordered batch of normalized [`ChangeRecord`]s:
//!
//! - [`NumberedLogFeed`]: numbered changelog (LDAP cn=changelog, JDBC change
//!   table) filtered strictly after the tracked change number.
//! - [`CookieFeed`]: opaque-cookie incremental replication (AD-style); the
//!   first scan establishes a baseline cookie whose records are already
//!   present downstream and are not replayed.
//! - [`SnapshotFeed`]: no incremental notion; the whole source as a
//!   full-replace instruction set, for sources without a changelog or for
//!   forced resynchronization.
//!
//! The strategy is chosen from configuration when the engine is built, never
//! by runtime type inspection.

mod cookie;
mod numbered;
mod snapshot;

pub use cookie::{CookieFeed, DEFAULT_TOMBSTONE_ATTRIBUTE};
pub use numbered::NumberedLogFeed;
pub use snapshot::SnapshotFeed;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{ChangeRecord, Position};
use crate::source::AdminSession;

/// One pull's worth of changes.
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    /// Records in ascending sequence order.
    pub records: Vec<ChangeRecord>,
    /// Position after the last record in this batch, when the strategy has
    /// one (`None` for snapshots and for empty numbered batches).
    pub new_position: Option<Position>,
}

impl FeedBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Polymorphic change feed.
///
/// `pull` must return records ordered by ascending sequence, every sequence
/// strictly after `position` (or everything, if `position` is absent), and
/// must be safe to call repeatedly with the same position — an idempotent
/// query, never a side-effecting read.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Name of the source this feed reads (for logs and errors).
    fn source_name(&self) -> &str;

    /// All changes strictly after `position`.
    async fn pull(
        &self,
        session: &dyn AdminSession,
        position: Option<&Position>,
    ) -> Result<FeedBatch>;

    /// The position a fresh consumer should start after, so that a
    /// subsequent `pull` resumes exactly past present state: the changelog's
    /// current maximum change number, or a fresh baseline cookie. `None`
    /// when the strategy has no position notion (snapshots).
    async fn current_position(&self, session: &dyn AdminSession) -> Result<Option<Position>>;
}
