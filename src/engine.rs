// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication engine.
//!
//! Orchestrates one synchronization pass over a (source, destinations,
//! tracker) configuration: resolve the last position, pull the feed, replay
//! records against each destination in order, advance the tracker after
//! every durable application, and account the run in a
//! [`SynchronizationResult`].
//!
//! # Run Lifecycle
//!
//! ```text
//! Idle → SessionOpen → Resolving → Replaying → Advancing → Closed
//! ```
//!
//! Each `run()` starts from `Idle`; no state machine survives between runs.
//! The administrative session spans the whole run and is closed on every
//! exit path, success or failure.
//!
//! # Failure Model
//!
//! - Feed and session errors abort the run; the tracker is untouched.
//! - A destination write failure counts one `failed_entries` and stops the
//!   remaining records of the run (fail-stop). The tracker stays at the last
//!   success, so the failing record is retried next run — at-least-once,
//!   head-of-line blocking.
//! - Bulk paths (`load`, `reconcile`) catch and log per-record failures
//!   instead, because they rebuild rather than replay.
//!
//! # Concurrency
//!
//! The engine owns no tasks and takes no locks around the tracker. At most
//! one `run()` may execute concurrently for a given (source, destination,
//! tracker) triple; concurrent runs would race the position read-modify-write
//! and silently skip or duplicate a window of changes. Enforce this in the
//! caller — a scheduler with single-flight jobs, or one dedicated
//! [`PollLoop`](crate::poll::PollLoop) per source.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::feed::ChangeFeed;
use crate::mapping::DestinationMapping;
use crate::record::{
    diff_attributes, Attributes, ChangeAction, ChangeRecord, Identity, Modification, Payload,
    Position,
};
use crate::result::SynchronizationResult;
use crate::source::{
    AdminSession, Destination, DestinationError, SearchRequest, SessionProvider, Source,
};
use crate::tracker::PositionStore;

/// Phase of one synchronization run, for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    SessionOpen,
    Resolving,
    Replaying,
    Advancing,
    Closed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "Idle",
            RunPhase::SessionOpen => "SessionOpen",
            RunPhase::Resolving => "Resolving",
            RunPhase::Replaying => "Replaying",
            RunPhase::Advancing => "Advancing",
            RunPhase::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// One synchronized destination: the store plus its optional field mappings.
///
/// The map name identifies the destination in the tracker key and in the
/// scoped run/management operations.
pub struct SyncMap {
    pub name: String,
    pub destination: Arc<dyn Destination>,
    pub mapping: Option<DestinationMapping>,
}

impl SyncMap {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self {
            name: destination.name().to_string(),
            destination,
            mapping: None,
        }
    }

    pub fn with_mapping(mut self, mapping: DestinationMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }
}

/// The change replication engine for one source and its destinations.
pub struct ReplicationEngine {
    source: Arc<dyn Source>,
    feed: Arc<dyn ChangeFeed>,
    tracker: Arc<dyn PositionStore>,
    sessions: Arc<dyn SessionProvider>,
    maps: Vec<SyncMap>,
    /// Changes originated by this principal are skipped during replay
    /// (self-change loop prevention), but still advance the tracker.
    local_user: Option<String>,
    /// Attributes excluded from reconciliation diffs.
    ignored_attributes: HashSet<String>,
}

impl ReplicationEngine {
    pub fn new(
        source: Arc<dyn Source>,
        feed: Arc<dyn ChangeFeed>,
        tracker: Arc<dyn PositionStore>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            source,
            feed,
            tracker,
            sessions,
            maps: Vec::new(),
            local_user: None,
            ignored_attributes: HashSet::new(),
        }
    }

    pub fn add_map(mut self, map: SyncMap) -> Self {
        self.maps.push(map);
        self
    }

    pub fn with_local_user(mut self, user: impl Into<String>) -> Self {
        self.local_user = Some(user.into());
        self
    }

    pub fn with_ignored_attributes(
        mut self,
        attributes: impl IntoIterator<Item = String>,
    ) -> Self {
        self.ignored_attributes = attributes.into_iter().collect();
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn map_names(&self) -> Vec<&str> {
        self.maps.iter().map(|m| m.name.as_str()).collect()
    }

    fn tracker_key(&self, map: &SyncMap) -> String {
        format!("{}/{}", self.source.name(), map.name)
    }

    fn find_map(&self, name: &str) -> Result<&SyncMap> {
        self.maps
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| SyncError::Config(format!("no map named {}", name)))
    }

    async fn open_session(&self) -> Result<Box<dyn AdminSession>> {
        let session = self.sessions.open_admin().await?;
        debug!(phase = %RunPhase::SessionOpen, session = session.id(), "Opened admin session");
        Ok(session)
    }

    async fn close_session(&self, session: Box<dyn AdminSession>) {
        session.close().await;
        debug!(phase = %RunPhase::Closed, "Admin session closed");
    }

    /// One synchronization pass over every configured map.
    pub async fn run(&self) -> Result<SynchronizationResult> {
        let session = self.open_session().await?;
        let outcome = self.run_all(session.as_ref()).await;
        self.close_session(session).await;

        match &outcome {
            Ok(result) => {
                info!(source = self.source.name(), %result, "Synchronization run complete");
                crate::metrics::record_run(self.source.name(), result);
            }
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "Synchronization run failed");
                crate::metrics::record_run_error(self.source.name());
            }
        }
        outcome
    }

    /// One synchronization pass over the single named map.
    pub async fn run_scoped(&self, map_name: &str) -> Result<SynchronizationResult> {
        let map = self.find_map(map_name)?;

        let session = self.open_session().await?;
        let outcome = self.run_map(session.as_ref(), map).await;
        self.close_session(session).await;

        if let Ok(result) = &outcome {
            crate::metrics::record_run(self.source.name(), result);
        }
        outcome
    }

    async fn run_all(&self, session: &dyn AdminSession) -> Result<SynchronizationResult> {
        let mut merged = SynchronizationResult::new();
        for map in &self.maps {
            let result = self.run_map(session, map).await?;
            merged.merge(&result);
        }
        Ok(merged)
    }

    async fn run_map(
        &self,
        session: &dyn AdminSession,
        map: &SyncMap,
    ) -> Result<SynchronizationResult> {
        let key = self.tracker_key(map);

        debug!(phase = %RunPhase::Resolving, tracker = %key, "Resolving last position");
        let position = self.tracker.get(&key).await?;

        let batch = self.feed.pull(session, position.as_ref()).await?;
        crate::metrics::record_records_pulled(self.source.name(), batch.records.len());

        if batch.is_empty() {
            debug!(tracker = %key, "No new changes");
            return Ok(SynchronizationResult::new());
        }

        let started = Instant::now();
        let mut result = SynchronizationResult::new();
        result.source_entries = batch.records.len() as u64;
        result.target_entries = match map.destination.count(session).await {
            Ok(count) => count as i64,
            Err(e) => {
                warn!(destination = %map.name, error = %e, "Failed to count destination entries");
                0
            }
        };

        debug!(
            phase = %RunPhase::Replaying,
            tracker = %key,
            records = batch.records.len(),
            "Replaying changes"
        );

        let mut tracked = position.is_some();
        for record in &batch.records {
            if self.is_self_change(record) {
                debug!(sequence = %record.sequence, actor = %record.actor, "Skipping self-originated change");
                result.inc_unchanged();
                // The position must still move past self-originated changes,
                // or they would be re-read forever.
                self.advance_tracker(&key, &record.sequence, &mut tracked)
                    .await?;
                continue;
            }

            match self.apply(session, map, record).await {
                Ok(Some(action)) => {
                    match action {
                        ChangeAction::Add => result.inc_added(),
                        ChangeAction::Modify | ChangeAction::ModRdn => result.inc_modified(),
                        ChangeAction::Delete => result.inc_deleted(),
                    }
                    crate::metrics::record_record_applied(self.source.name(), action.as_str());
                    self.advance_tracker(&key, &record.sequence, &mut tracked)
                        .await?;
                }
                Ok(None) => {
                    // Translation skipped: dropped, not a failure.
                    self.advance_tracker(&key, &record.sequence, &mut tracked)
                        .await?;
                }
                Err(e) => {
                    result.inc_failed();
                    crate::metrics::record_record_failed(self.source.name());
                    error!(
                        sequence = %record.sequence,
                        identity = %record.identity,
                        destination = %map.name,
                        error = %e,
                        "Apply failed, aborting remaining records in this run"
                    );
                    break;
                }
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    fn is_self_change(&self, record: &ChangeRecord) -> bool {
        match &self.local_user {
            Some(user) => !record.actor.is_empty() && record.actor == *user,
            None => false,
        }
    }

    /// Translate one record into a destination call.
    ///
    /// `Ok(None)` means the record's action and payload do not line up and
    /// the record is dropped (logged at debug, not counted as a failure).
    async fn apply(
        &self,
        session: &dyn AdminSession,
        map: &SyncMap,
        record: &ChangeRecord,
    ) -> std::result::Result<Option<ChangeAction>, DestinationError> {
        let destination = &map.destination;
        match (record.action, &record.payload) {
            (ChangeAction::Add, Payload::Attributes(attributes)) => {
                debug!(identity = %record.identity, "Adding entry");
                destination.add(session, &record.identity, attributes).await?;
            }
            (ChangeAction::Modify, Payload::Modifications(modifications)) => {
                debug!(identity = %record.identity, "Modifying entry");
                destination
                    .modify(session, &record.identity, modifications)
                    .await?;
            }
            (ChangeAction::Modify, Payload::Attributes(attributes)) => {
                // Full replace of every listed field, not a merge.
                debug!(identity = %record.identity, "Replacing entry fields");
                let modifications: Vec<Modification> = attributes
                    .iter()
                    .map(|(name, values)| Modification::replace(name, values.to_vec()))
                    .collect();
                destination
                    .modify(session, &record.identity, &modifications)
                    .await?;
            }
            (ChangeAction::ModRdn, Payload::NewIdentity(new_identity)) => {
                debug!(identity = %record.identity, new_identity = %new_identity, "Renaming entry");
                destination
                    .rename(session, &record.identity, new_identity)
                    .await?;
            }
            (ChangeAction::Delete, _) => {
                debug!(identity = %record.identity, "Deleting entry");
                destination.delete(session, &record.identity).await?;
            }
            (action, _) => {
                debug!(
                    sequence = %record.sequence,
                    action = %action,
                    "Record payload does not match its action, dropping"
                );
                return Ok(None);
            }
        }
        Ok(Some(record.action))
    }

    async fn advance_tracker(
        &self,
        key: &str,
        sequence: &Position,
        tracked: &mut bool,
    ) -> Result<()> {
        tracing::trace!(phase = %RunPhase::Advancing, tracker = %key, sequence = %sequence, "Advancing tracker");
        if *tracked {
            self.tracker.advance(key, sequence).await
        } else {
            self.tracker.create(key, sequence).await?;
            *tracked = true;
            Ok(())
        }
    }

    /// Bulk rebuild: load the full source into shadow destinations, set the
    /// tracker baseline, then switch the shadows over.
    ///
    /// The switchover is best-effort, not transactional: dropping the old
    /// live store and promoting the shadow are attempted independently, and
    /// a failure in either is logged without aborting the other. A crash
    /// between the two steps leaves no live destination — a known gap,
    /// exercised (not fixed) by the test suite.
    pub async fn load(&self) -> Result<SynchronizationResult> {
        let session = self.open_session().await?;
        let outcome = self.load_inner(session.as_ref()).await;
        self.close_session(session).await;
        outcome
    }

    async fn load_inner(&self, session: &dyn AdminSession) -> Result<SynchronizationResult> {
        let started = Instant::now();
        info!(source = self.source.name(), "Starting bulk load");

        let mut shadows: Vec<Arc<dyn Destination>> = Vec::with_capacity(self.maps.len());
        for map in &self.maps {
            let shadow = map.destination.shadow().await.map_err(|e| {
                SyncError::Internal(format!("failed to create shadow for {}: {}", map.name, e))
            })?;
            shadows.push(shadow);
        }

        let reply = self
            .source
            .search(session, &SearchRequest::all())
            .await
            .map_err(|e| SyncError::feed(self.source.name(), e.to_string()))?;

        let mut result = SynchronizationResult::new();
        result.source_entries = reply.records.len() as u64;

        for raw in &reply.records {
            for (map, shadow) in self.maps.iter().zip(shadows.iter()) {
                let (identity, attributes) = match &map.mapping {
                    Some(mapping) => match mapping.project(&raw.attributes) {
                        Some(projected) => projected,
                        // Empty primary-key field: skipped for this
                        // destination, not an error.
                        None => continue,
                    },
                    None => (raw.identity.clone(), raw.attributes.clone()),
                };

                match shadow.add(session, &identity, &attributes).await {
                    Ok(()) => result.inc_added(),
                    Err(e) => {
                        warn!(identity = %identity, destination = %map.name, error = %e, "Failed to load entry");
                        result.inc_failed();
                    }
                }
            }
        }

        // Baseline so that the next run starts exactly after this snapshot.
        let baseline = self.feed.current_position(session).await?;
        for map in &self.maps {
            let key = self.tracker_key(map);
            self.tracker.clear(&key).await?;
            if let Some(position) = &baseline {
                self.tracker.create(&key, position).await?;
                info!(tracker = %key, position = %position, "Tracker baseline established");
            }
        }

        for (map, shadow) in self.maps.iter().zip(shadows.iter()) {
            info!(destination = %map.name, shadow = shadow.name(), "Switching over");
            if let Err(e) = map.destination.drop_store(session).await {
                warn!(destination = %map.name, error = %e, "Failed to drop live destination");
            }
            if let Err(e) = shadow.promote(session, map.destination.name()).await {
                warn!(destination = %map.name, error = %e, "Failed to promote shadow destination");
            }
        }

        result.duration = started.elapsed();
        info!(source = self.source.name(), %result, "Bulk load complete");
        Ok(result)
    }

    /// Diff-synchronization: compare the source against each destination and
    /// apply the difference.
    ///
    /// Used where no changelog exists but a rebuild-from-scratch is too
    /// disruptive. Per-entry failures are counted, never fail-stop.
    pub async fn reconcile(&self) -> Result<SynchronizationResult> {
        let session = self.open_session().await?;
        let outcome = self.reconcile_inner(session.as_ref()).await;
        self.close_session(session).await;
        outcome
    }

    async fn reconcile_inner(&self, session: &dyn AdminSession) -> Result<SynchronizationResult> {
        let mut merged = SynchronizationResult::new();
        for map in &self.maps {
            let result = self.reconcile_map(session, map).await?;
            merged.merge(&result);
        }
        info!(source = self.source.name(), result = %merged, "Reconciliation complete");
        Ok(merged)
    }

    async fn reconcile_map(
        &self,
        session: &dyn AdminSession,
        map: &SyncMap,
    ) -> Result<SynchronizationResult> {
        let started = Instant::now();
        let mut result = SynchronizationResult::new();

        let existing = map.destination.identities(session).await.map_err(|e| {
            SyncError::Internal(format!("failed to list {} identities: {}", map.name, e))
        })?;
        result.target_entries = existing.len() as i64;
        let mut remaining: BTreeSet<Identity> = existing.into_iter().collect();

        let reply = self
            .source
            .search(session, &SearchRequest::all())
            .await
            .map_err(|e| SyncError::feed(self.source.name(), e.to_string()))?;
        result.source_entries = reply.records.len() as u64;

        for raw in &reply.records {
            let (identity, desired) = match &map.mapping {
                Some(mapping) => match mapping.project(&raw.attributes) {
                    Some(projected) => projected,
                    None => continue,
                },
                None => (raw.identity.clone(), raw.attributes.clone()),
            };

            if remaining.remove(&identity) {
                self.reconcile_existing(session, map, &identity, &desired, &mut result)
                    .await;
            } else {
                match map.destination.add(session, &identity, &desired).await {
                    Ok(()) => result.inc_added(),
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Failed to add entry");
                        result.inc_failed();
                    }
                }
            }
        }

        // Leaf-most first, so children go before their subtree base.
        for identity in remaining.iter().rev() {
            match map.destination.delete(session, identity).await {
                Ok(()) => result.inc_deleted(),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Failed to delete entry");
                    result.inc_failed();
                }
            }
        }

        result.duration = started.elapsed();
        Ok(result)
    }

    async fn reconcile_existing(
        &self,
        session: &dyn AdminSession,
        map: &SyncMap,
        identity: &Identity,
        desired: &Attributes,
        result: &mut SynchronizationResult,
    ) {
        match map.destination.fetch(session, identity).await {
            Ok(Some(current)) => {
                let modifications = diff_attributes(&current, desired, &self.ignored_attributes);
                if modifications.is_empty() {
                    result.inc_unchanged();
                    return;
                }
                match map
                    .destination
                    .modify(session, identity, &modifications)
                    .await
                {
                    Ok(()) => result.inc_modified(),
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Failed to modify entry");
                        result.inc_failed();
                    }
                }
            }
            Ok(None) => match map.destination.add(session, identity, desired).await {
                Ok(()) => result.inc_added(),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Failed to add entry");
                    result.inc_failed();
                }
            },
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to fetch entry");
                result.inc_failed();
            }
        }
    }

    /// Administrative reset: wipe destination contents and tracker entries.
    pub async fn clear(&self) -> Result<()> {
        let session = self.open_session().await?;
        let outcome = self.clear_inner(session.as_ref()).await;
        self.close_session(session).await;
        outcome
    }

    async fn clear_inner(&self, session: &dyn AdminSession) -> Result<()> {
        for map in &self.maps {
            info!(destination = %map.name, "Clearing destination");
            map.destination
                .clear(session)
                .await
                .map_err(|e| SyncError::Internal(format!("failed to clear {}: {}", map.name, e)))?;
            self.tracker.clear(&self.tracker_key(map)).await?;
        }
        Ok(())
    }

    /// Create tracker baselines for maps that have never been tracked, so
    /// that incremental pulls start after present state. No-op for maps that
    /// already have a position.
    pub async fn establish_baseline(&self) -> Result<()> {
        let session = self.open_session().await?;
        let outcome = self.establish_baseline_inner(session.as_ref()).await;
        self.close_session(session).await;
        outcome
    }

    async fn establish_baseline_inner(&self, session: &dyn AdminSession) -> Result<()> {
        let mut untracked = Vec::new();
        for map in &self.maps {
            let key = self.tracker_key(map);
            if self.tracker.get(&key).await?.is_none() {
                untracked.push(key);
            }
        }
        if untracked.is_empty() {
            return Ok(());
        }

        let Some(position) = self.feed.current_position(session).await? else {
            debug!(source = self.source.name(), "Feed has no position notion, no baseline to establish");
            return Ok(());
        };

        for key in untracked {
            self.tracker.create(&key, &position).await?;
            info!(tracker = %key, position = %position, "Tracker baseline established");
        }
        Ok(())
    }

    /// Number of records in the source (informational).
    pub async fn source_count(&self) -> Result<u64> {
        let session = self.open_session().await?;
        let outcome = self
            .source
            .count(session.as_ref())
            .await
            .map_err(|e| SyncError::feed(self.source.name(), e.to_string()));
        self.close_session(session).await;
        outcome
    }

    /// Total records across all destinations (informational).
    pub async fn target_count(&self) -> Result<u64> {
        let session = self.open_session().await?;
        let outcome = self.target_count_inner(session.as_ref()).await;
        self.close_session(session).await;
        outcome
    }

    async fn target_count_inner(&self, session: &dyn AdminSession) -> Result<u64> {
        let mut total = 0;
        for map in &self.maps {
            total += map
                .destination
                .count(session)
                .await
                .map_err(|e| SyncError::Internal(format!("failed to count {}: {}", map.name, e)))?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_phase_display() {
        assert_eq!(RunPhase::Idle.to_string(), "Idle");
        assert_eq!(RunPhase::SessionOpen.to_string(), "SessionOpen");
        assert_eq!(RunPhase::Resolving.to_string(), "Resolving");
        assert_eq!(RunPhase::Replaying.to_string(), "Replaying");
        assert_eq!(RunPhase::Advancing.to_string(), "Advancing");
        assert_eq!(RunPhase::Closed.to_string(), "Closed");
    }
}
