// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they occur in a synchronization run.
//! Feed-level and session-level failures terminate the run; per-record
//! application failures never surface here — the replay loop converts them
//! into [`SynchronizationResult`](crate::result::SynchronizationResult)
//! counters and log entries.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `FeedUnavailable` | Yes | Source changelog/feed query failed |
//! | `Session` | Yes | Administrative session could not be opened |
//! | `TrackerStore` | No | Local SQLite tracker errors (needs operator attention) |
//! | `AlreadyTracked` | No | `create` called for a name that already has a position |
//! | `NotTracked` | No | `advance` called for a name with no position yet |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether the caller (typically
//! a scheduler or poll loop) should retry the run. Retryable errors indicate
//! transient source or session availability issues; the tracker is left
//! untouched, so a retry resumes from the same position.

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can terminate a synchronization run.
///
/// Tracker-precondition variants (`AlreadyTracked`, `NotTracked`) indicate
/// ordering bugs in the caller, never transient conditions.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source feed query failed.
    ///
    /// The run is aborted and the tracker is untouched, so the next run
    /// re-reads the same window. Retryable.
    #[error("feed unavailable ({source_name}): {message}")]
    FeedUnavailable { source_name: String, message: String },

    /// The administrative session could not be opened or failed mid-run.
    ///
    /// Retryable with backoff.
    #[error("session error: {0}")]
    Session(String),

    /// Tracker persistence failure.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("tracker store error: {0}")]
    TrackerStore(#[from] sqlx::Error),

    /// `create` was called for a source name that is already tracked.
    ///
    /// A programming/ordering error in the replay loop. Fatal to the run.
    #[error("position already tracked for {0}")]
    AlreadyTracked(String),

    /// `advance` was called for a source name with no tracker entry.
    ///
    /// A programming/ordering error in the replay loop. Fatal to the run.
    #[error("no position tracked for {0}")]
    NotTracked(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    ///
    /// Catch-all for conditions that shouldn't happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a feed error for the named source.
    pub fn feed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FeedUnavailable {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FeedUnavailable { .. } => true,
            Self::Session(_) => true,
            Self::TrackerStore(_) => false,
            Self::AlreadyTracked(_) => false,
            Self::NotTracked(_) => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_feed() {
        let err = SyncError::feed("changelog", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("changelog"));
    }

    #[test]
    fn test_is_retryable_session() {
        let err = SyncError::Session("bind failed".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_tracker_preconditions() {
        assert!(!SyncError::AlreadyTracked("users".to_string()).is_retryable());
        assert!(!SyncError::NotTracked("users".to_string()).is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("no destinations".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = SyncError::Internal("unexpected".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_precondition_error_formatting() {
        let err = SyncError::NotTracked("users".to_string());
        assert!(err.to_string().contains("users"));

        let err = SyncError::AlreadyTracked("groups".to_string());
        assert!(err.to_string().contains("groups"));
    }
}
