//! # Source Sync
//!
//! A change replication engine for keeping a destination data store
//! synchronized with heterogeneous source repositories — an LDAP changelog,
//! a JDBC changelog table, or an AD-style incremental-replication control —
//! without losing or duplicating changes, and without re-scanning the
//! destination from scratch on every run.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           source-sync                               │
//! │                                                                     │
//! │  ┌────────────┐    ┌───────────────────┐    ┌────────────────────┐  │
//! │  │ ChangeFeed │───►│ ReplicationEngine │───►│ Destination        │  │
//! │  │ numbered / │    │ (ordered replay)  │    │ add/modify/rename/ │  │
//! │  │ cookie /   │    └───────────────────┘    │ delete by identity │  │
//! │  │ snapshot   │              │              └────────────────────┘  │
//! │  └────────────┘              ▼                                      │
//! │        ▲           ┌──────────────────┐                             │
//! │        │           │ PositionStore    │                             │
//! │  ┌───────────┐     │ (SQLite tracker) │                             │
//! │  │ PollLoop  │     └──────────────────┘                             │
//! │  │ (cookie)  │                                                      │
//! │  └───────────┘                                                      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An external trigger (scheduler tick, manual invocation, or a
//! [`PollLoop`] tick for cookie feeds) calls [`ReplicationEngine::run`].
//! The engine resolves the last position from the tracker, pulls every
//! [`ChangeRecord`](record::ChangeRecord) after it from the configured
//! [`ChangeFeed`](feed::ChangeFeed), replays each against the destinations
//! in ascending sequence order, and advances the tracker after every
//! durable application — at-least-once delivery with idempotent replay.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use source_sync::{NumberedLogFeed, ReplicationEngine, SqliteTracker, SyncMap};
//! # use source_sync::source::{Source, Destination, SessionProvider};
//! # async fn example(
//! #     source: Arc<dyn Source>,
//! #     changelog: Arc<dyn Source>,
//! #     destination: Arc<dyn Destination>,
//! #     sessions: Arc<dyn SessionProvider>,
//! # ) -> source_sync::Result<()> {
//! let tracker = Arc::new(SqliteTracker::open("tracker.db").await?);
//! let feed = Arc::new(NumberedLogFeed::new(changelog));
//!
//! let engine = ReplicationEngine::new(source, feed, tracker, sessions)
//!     .add_map(SyncMap::new(destination))
//!     .with_local_user("cn=sync,ou=system");
//!
//! let result = engine.run().await?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```
//!
//! ## Single-Flight Requirement
//!
//! At most one `run()` may execute concurrently for a given
//! (source, destination, tracker) triple. The engine does not lock the
//! tracker internally; enforce single-flight in the scheduler, or drive the
//! source with one dedicated [`PollLoop`].

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod filter;
pub mod mapping;
pub mod metrics;
pub mod poll;
pub mod record;
pub mod result;
pub mod source;
pub mod tracker;

// Re-exports for convenience
pub use config::{FeedConfig, MapConfig, PollConfig, SyncConfig, TrackerConfig};
pub use engine::{ReplicationEngine, RunPhase, SyncMap};
pub use error::{Result, SyncError};
pub use feed::{ChangeFeed, CookieFeed, FeedBatch, NumberedLogFeed, SnapshotFeed};
pub use filter::{CompareOp, Filter};
pub use mapping::{DestinationMapping, FieldExpr, FieldMapping};
pub use poll::PollLoop;
pub use record::{
    Attributes, ChangeAction, ChangeRecord, Identity, Modification, ModifyOp, Payload, Position,
};
pub use result::SynchronizationResult;
pub use tracker::{MemoryTracker, PositionStore, SqliteTracker};
