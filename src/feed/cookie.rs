// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Opaque-cookie incremental feed.
//!
//! For sources exposing AD-style incremental replication: every reply
//! carries an opaque resumption cookie, and a scan resumed from a cookie
//! returns only the records that changed since, with a flag attribute
//! marking tombstones.
//!
//! # Baseline
//!
//! The first scan (no prior cookie) walks the full scope and asks the source
//! for a baseline cookie. Those records represent current state that is
//! already synchronized downstream, so the baseline **records are not
//! replayed** — only the cookie is kept. [`PollLoop`](crate::poll::PollLoop)
//! establishes the baseline once at startup via
//! [`current_position`](crate::feed::ChangeFeed::current_position).
//!
//! Changed records cannot be told apart from new ones by this mechanism, so
//! they are emitted as ADDs with their full attribute set; the destination's
//! add is idempotent by identity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, FeedBatch};
use crate::record::{ChangeAction, ChangeRecord, Identity, Payload, Position};
use crate::source::{AdminSession, CookieMode, SearchReply, SearchRequest, Source};

/// Default tombstone flag attribute.
pub const DEFAULT_TOMBSTONE_ATTRIBUTE: &str = "isDeleted";

/// Feed over an incremental-replication source.
pub struct CookieFeed {
    source: Arc<dyn Source>,
    /// Scope base; records outside it are discarded before being returned.
    base: Identity,
    /// Attributes to request; empty means all.
    fields: Vec<String>,
    /// Flag attribute marking deleted records in incremental replies.
    tombstone_attribute: String,
}

impl CookieFeed {
    pub fn new(source: Arc<dyn Source>, base: Identity) -> Self {
        Self {
            source,
            base,
            fields: Vec::new(),
            tombstone_attribute: DEFAULT_TOMBSTONE_ATTRIBUTE.to_string(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_tombstone_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.tombstone_attribute = attribute.into();
        self
    }

    async fn scan(&self, session: &dyn AdminSession, cookie: CookieMode) -> Result<SearchReply> {
        let request = SearchRequest::all()
            .with_base(self.base.clone())
            .with_attributes(self.fields.clone())
            .with_cookie(cookie);

        self.source
            .search(session, &request)
            .await
            .map_err(|e| SyncError::feed(self.source.name(), e.to_string()))
    }

    /// Full scoped scan that only exists to obtain the baseline cookie.
    async fn baseline(&self, session: &dyn AdminSession) -> Result<Position> {
        let reply = self.scan(session, CookieMode::Request).await?;

        let cookie = reply.cookie.ok_or_else(|| {
            SyncError::feed(self.source.name(), "source returned no resumption cookie")
        })?;

        debug!(
            source = self.source.name(),
            discarded = reply.records.len(),
            "Established baseline cookie; current records not replayed"
        );
        Ok(Position::Cookie(cookie))
    }

    fn is_tombstone(&self, record: &crate::source::RawRecord) -> bool {
        matches!(
            record.attributes.get_value(&self.tombstone_attribute),
            Some("true") | Some("TRUE") | Some("1")
        )
    }
}

#[async_trait]
impl ChangeFeed for CookieFeed {
    fn source_name(&self) -> &str {
        self.source.name()
    }

    async fn pull(
        &self,
        session: &dyn AdminSession,
        position: Option<&Position>,
    ) -> Result<FeedBatch> {
        let cookie = match position {
            None => {
                // No prior cookie: the baseline scan yields no records to
                // replay, only a position for the caller to record.
                let baseline = self.baseline(session).await?;
                return Ok(FeedBatch {
                    records: Vec::new(),
                    new_position: Some(baseline),
                });
            }
            Some(Position::Cookie(cookie)) => cookie.clone(),
            Some(other) => {
                return Err(SyncError::feed(
                    self.source.name(),
                    format!("cookie feed resumed with non-cookie position {}", other),
                ));
            }
        };

        let reply = self.scan(session, CookieMode::Resume(cookie)).await?;
        let new_cookie = reply.cookie.ok_or_else(|| {
            SyncError::feed(self.source.name(), "source returned no resumption cookie")
        })?;

        let sequence = Position::Cookie(new_cookie.clone());
        let timestamp = Utc::now();
        let mut records = Vec::with_capacity(reply.records.len());

        for raw in &reply.records {
            if !raw.identity.is_under(&self.base) {
                debug!(identity = %raw.identity, base = %self.base, "Record out of scope, dropping");
                continue;
            }

            let record = if self.is_tombstone(raw) {
                ChangeRecord {
                    sequence: sequence.clone(),
                    timestamp,
                    actor: raw.attributes.get_value("changeUser").unwrap_or("").to_string(),
                    action: ChangeAction::Delete,
                    identity: raw.identity.clone(),
                    payload: Payload::None,
                }
            } else {
                let mut attributes = raw.attributes.clone();
                attributes.remove(&self.tombstone_attribute);
                ChangeRecord {
                    sequence: sequence.clone(),
                    timestamp,
                    actor: raw.attributes.get_value("changeUser").unwrap_or("").to_string(),
                    action: ChangeAction::Add,
                    identity: raw.identity.clone(),
                    payload: Payload::Attributes(attributes),
                }
            };
            records.push(record);
        }

        Ok(FeedBatch {
            records,
            new_position: Some(sequence),
        })
    }

    async fn current_position(&self, session: &dyn AdminSession) -> Result<Option<Position>> {
        Ok(Some(self.baseline(session).await?))
    }
}
