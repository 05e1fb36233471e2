//! Configuration for the replication engine.
//!
//! Configuration is constructed programmatically or deserialized from
//! YAML/JSON by the embedding layer; this crate only defines the types and
//! their validation.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── source: String               # Name of the synchronized source
//! ├── feed: FeedConfig             # Which change-feed strategy to use
//! ├── destinations: Vec<MapConfig> # One entry per destination map
//! ├── local_user: Option<String>   # Self-change loop prevention
//! ├── ignored_attributes: Vec<String>
//! ├── tracker: TrackerConfig       # SQLite position persistence
//! └── poll: PollConfig             # Cookie-feed poll interval
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source: "hr-users"
//!
//! feed:
//!   strategy: numbered_log
//!   changelog: "hr-changelog"
//!   boundary_compat: true
//!
//! destinations:
//!   - name: "directory-users"
//!
//! local_user: "cn=sync,ou=system"
//!
//! tracker:
//!   sqlite_path: "/var/lib/source-sync/tracker.db"
//!
//! poll:
//!   interval_secs: 30
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Top-level configuration for one synchronized source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Name of the synchronized source.
    pub source: String,

    /// Change-feed strategy, fixed at construction time.
    pub feed: FeedConfig,

    /// Destination maps fed from this source.
    pub destinations: Vec<MapConfig>,

    /// Principal whose changes are skipped during replay. Required when the
    /// destination's own writes are logged back into the source.
    #[serde(default)]
    pub local_user: Option<String>,

    /// Attributes excluded from reconciliation diffs
    /// (operational timestamps and the like).
    #[serde(default)]
    pub ignored_attributes: Vec<String>,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub poll: PollConfig,
}

impl SyncConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(source: &str) -> Self {
        Self {
            source: source.to_string(),
            feed: FeedConfig::Snapshot {},
            destinations: Vec::new(),
            local_user: None,
            ignored_attributes: Vec::new(),
            tracker: TrackerConfig::in_memory(),
            poll: PollConfig::default(),
        }
    }

    /// Check structural invariants before building an engine from this config.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(SyncError::Config("source name is empty".to_string()));
        }
        if self.destinations.is_empty() {
            return Err(SyncError::Config("no destinations configured".to_string()));
        }
        if let FeedConfig::NumberedLog { changelog, .. } = &self.feed {
            if changelog.trim().is_empty() {
                return Err(SyncError::Config("changelog name is empty".to_string()));
            }
        }
        if self.poll.interval_secs == 0 {
            return Err(SyncError::Config("poll interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// One destination map entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Destination (and map) name.
    pub name: String,
}

/// Change-feed strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FeedConfig {
    /// Numbered changelog (LDAP cn=changelog or JDBC change table).
    NumberedLog {
        /// Name of the changelog source.
        changelog: String,
        /// Use the `(>= X) AND NOT (= X)` window form for backends that
        /// return boundary duplicates.
        #[serde(default)]
        boundary_compat: bool,
    },
    /// Opaque-cookie incremental replication (AD-style).
    Cookie {
        /// Scope base identity, e.g. `ou=people`.
        base: String,
        /// Attributes to replicate; empty means all.
        #[serde(default)]
        fields: Vec<String>,
        /// Flag attribute marking tombstones.
        #[serde(default = "default_tombstone_attribute")]
        tombstone_attribute: String,
    },
    /// Full snapshot on every pull.
    Snapshot {},
}

fn default_tombstone_attribute() -> String {
    crate::feed::DEFAULT_TOMBSTONE_ATTRIBUTE.to_string()
}

/// Tracker persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Path to the SQLite tracker database.
    #[serde(default = "default_tracker_path")]
    pub sqlite_path: String,
}

fn default_tracker_path() -> String {
    "source-sync-tracker.db".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_tracker_path(),
        }
    }
}

impl TrackerConfig {
    /// In-memory tracker (tests, throwaway runs).
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

/// Poll loop settings (cookie feeds only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Fixed delay between poll runs, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
