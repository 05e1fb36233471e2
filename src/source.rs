// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumed capabilities: sources, destinations, and admin sessions.
//!
//! The engine never speaks a wire protocol. Everything it needs from the
//! outside world is expressed as one of three capabilities, implemented by
//! the excluded LDAP/JDBC connector layers (and by mocks in the test suite):
//!
//! - [`Source`]: ordered search over raw records, with optional cookie-based
//!   incremental scans.
//! - [`Destination`]: idempotent add/modify/rename/delete by identity, plus
//!   shadow-store management for the bulk-load switchover.
//! - [`SessionProvider`] / [`AdminSession`]: scoped acquisition of the
//!   administrative session a run operates under. The engine opens exactly
//!   one session per run and closes it on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Result;
use crate::filter::Filter;
use crate::record::{Attributes, Identity, Modification};

/// A raw row returned by a source search, before normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub identity: Identity,
    pub attributes: Attributes,
}

impl RawRecord {
    pub fn new(identity: Identity, attributes: Attributes) -> Self {
        Self {
            identity,
            attributes,
        }
    }
}

/// Cookie handling for a source search.
///
/// Incremental-replication sources (AD-style) attach an opaque resumption
/// cookie to their replies. `Request` asks for a baseline cookie alongside a
/// full scan; `Resume` replays only the changes since the given cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CookieMode {
    /// Plain search, no cookie involved.
    #[default]
    None,
    /// Full scan; the source must issue a baseline resumption cookie.
    Request,
    /// Incremental scan of changes since the given cookie.
    Resume(Vec<u8>),
}

/// Parameters of one source search.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Restrict results to identities under this base.
    pub base: Option<Identity>,
    /// Server-side filter, evaluated by the source.
    pub filter: Option<Filter>,
    /// Attributes to return; empty means all.
    pub attributes: Vec<String>,
    pub cookie: CookieMode,
}

impl SearchRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_base(mut self, base: Identity) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_cookie(mut self, cookie: CookieMode) -> Self {
        self.cookie = cookie;
        self
    }
}

/// Reply to a source search.
///
/// `records` are in the source's stable order for the given request; the
/// cookie is present when the request asked for or resumed one.
#[derive(Debug, Clone, Default)]
pub struct SearchReply {
    pub records: Vec<RawRecord>,
    pub cookie: Option<Vec<u8>>,
}

/// Failure reported by a source.
#[derive(Debug, Clone)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SourceError {}

/// A readable source repository (changelog, change table, or live tree).
///
/// For a given request, `search` must return records in a stable order, so
/// that repeated pulls from the same position are idempotent.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        session: &dyn AdminSession,
        request: &SearchRequest,
    ) -> std::result::Result<SearchReply, SourceError>;

    /// Number of records currently in the source (informational).
    async fn count(&self, session: &dyn AdminSession) -> std::result::Result<u64, SourceError>;
}

/// Typed failure from a destination write.
#[derive(Debug, Clone, Error)]
pub enum DestinationError {
    #[error("entry already exists: {0}")]
    AlreadyExists(Identity),
    #[error("entry not found: {0}")]
    NotFound(Identity),
    #[error("{0}")]
    Other(String),
}

/// A writable destination store, addressed by identity.
///
/// Writes are idempotent by identity from the engine's point of view; the
/// typed errors let the replay loop account for precondition failures
/// without inspecting backend-specific causes.
///
/// The shadow methods exist for the bulk-load switchover: `shadow()` creates
/// a parallel store of the same shape under an alternate name,
/// `drop_store()` removes this store entirely, and `promote(live_name)`
/// renames this (shadow) store into the live name.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    async fn add(
        &self,
        session: &dyn AdminSession,
        identity: &Identity,
        attributes: &Attributes,
    ) -> std::result::Result<(), DestinationError>;

    async fn modify(
        &self,
        session: &dyn AdminSession,
        identity: &Identity,
        modifications: &[Modification],
    ) -> std::result::Result<(), DestinationError>;

    async fn rename(
        &self,
        session: &dyn AdminSession,
        identity: &Identity,
        new_identity: &Identity,
    ) -> std::result::Result<(), DestinationError>;

    async fn delete(
        &self,
        session: &dyn AdminSession,
        identity: &Identity,
    ) -> std::result::Result<(), DestinationError>;

    /// Remove every record, keeping the store itself.
    async fn clear(&self, session: &dyn AdminSession) -> std::result::Result<(), DestinationError>;

    async fn count(&self, session: &dyn AdminSession) -> std::result::Result<u64, DestinationError>;

    /// Fetch one record's attributes, or `None` if absent.
    async fn fetch(
        &self,
        session: &dyn AdminSession,
        identity: &Identity,
    ) -> std::result::Result<Option<Attributes>, DestinationError>;

    /// All identities currently present, in sorted order.
    async fn identities(
        &self,
        session: &dyn AdminSession,
    ) -> std::result::Result<Vec<Identity>, DestinationError>;

    /// Create a parallel shadow store of the same shape under an alternate name.
    async fn shadow(&self) -> std::result::Result<Arc<dyn Destination>, DestinationError>;

    /// Drop this store entirely (contents and container).
    async fn drop_store(
        &self,
        session: &dyn AdminSession,
    ) -> std::result::Result<(), DestinationError>;

    /// Rename this store into `live_name`, taking over as the live store.
    async fn promote(
        &self,
        session: &dyn AdminSession,
        live_name: &str,
    ) -> std::result::Result<(), DestinationError>;
}

/// One administrative session, scoped to a single run.
///
/// `close` must be idempotent; the engine calls it exactly once per run, on
/// every exit path.
#[async_trait]
pub trait AdminSession: Send + Sync {
    fn id(&self) -> &str;

    async fn close(&self);
}

/// Factory for administrative sessions.
///
/// Implemented by the external session manager. The engine opens one session
/// per run and never shares it between runs.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open_admin(&self) -> Result<Box<dyn AdminSession>>;
}
