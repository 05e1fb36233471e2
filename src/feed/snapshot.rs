// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full-snapshot feed.
//!
//! For sources with no change-tracking mechanism at all, and for forced
//! resynchronization. `pull` ignores the position and returns the entire
//! source as ADD records with synthetic ascending sequence numbers; the
//! engine's bulk-load path pairs this with the shadow-store switchover.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, FeedBatch};
use crate::record::{ChangeAction, ChangeRecord, Identity, Payload, Position};
use crate::source::{AdminSession, SearchRequest, Source};

/// Feed that re-reads the whole source on every pull.
pub struct SnapshotFeed {
    source: Arc<dyn Source>,
    base: Option<Identity>,
}

impl SnapshotFeed {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self { source, base: None }
    }

    pub fn with_base(mut self, base: Identity) -> Self {
        self.base = Some(base);
        self
    }
}

#[async_trait]
impl ChangeFeed for SnapshotFeed {
    fn source_name(&self) -> &str {
        self.source.name()
    }

    async fn pull(
        &self,
        session: &dyn AdminSession,
        _position: Option<&Position>,
    ) -> Result<FeedBatch> {
        let mut request = SearchRequest::all();
        if let Some(base) = &self.base {
            request = request.with_base(base.clone());
        }

        let reply = self
            .source
            .search(session, &request)
            .await
            .map_err(|e| SyncError::feed(self.source.name(), e.to_string()))?;

        let timestamp = Utc::now();
        let records = reply
            .records
            .into_iter()
            .enumerate()
            .map(|(i, raw)| ChangeRecord {
                sequence: Position::Number(i as u64 + 1),
                timestamp,
                actor: String::new(),
                action: ChangeAction::Add,
                identity: raw.identity,
                payload: Payload::Attributes(raw.attributes),
            })
            .collect();

        Ok(FeedBatch {
            records,
            new_position: None,
        })
    }

    /// Snapshots have no incremental notion, so there is nothing to resume from.
    async fn current_position(&self, _session: &dyn AdminSession) -> Result<Option<Position>> {
        Ok(None)
    }
}
