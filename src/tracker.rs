// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable position tracking per synchronized source.
//!
//! One tracker entry per tracked name, owned exclusively by the engine:
//! created lazily on the first successfully-applied record, advanced in
//! place after each subsequent application, removed only by an explicit
//! administrative clear.
//!
//! # Cursor Semantics
//!
//! The stored position is the **last successfully applied** sequence. The
//! next run resumes with a strictly-greater-than filter, so a crash between
//! applying a record and advancing past it re-delivers that record
//! (at-least-once, idempotent replay on the destination side).
//!
//! ```text
//! read change #1234 → apply to destination → advance tracker to 1234
//!                     (crash here = re-read #1234, idempotent)
//! ```
//!
//! Positions only move forward. [`SqliteTracker`] refuses a numeric advance
//! below the stored value; cookie positions are opaque and replaced as
//! issued by the source.
//!
//! # Concurrency
//!
//! At most one live writer per tracked name. The store does not lock —
//! single-flight per (source, destination) is the caller's obligation, as
//! documented on [`ReplicationEngine`](crate::engine::ReplicationEngine).
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff up to a fixed attempt
//! limit before surfacing the error.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::record::Position;

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Durable last-processed-position store.
///
/// `create` and `advance` are deliberately separate operations with
/// precondition errors ([`SyncError::AlreadyTracked`] /
/// [`SyncError::NotTracked`]): the replay loop must create on the first
/// record it ever processes and advance thereafter, and a violation means
/// the loop's bookkeeping is broken.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The tracked position, or `None` if this name has never been tracked.
    async fn get(&self, name: &str) -> Result<Option<Position>>;

    /// Create the entry for `name`. Fails with `AlreadyTracked` if present.
    async fn create(&self, name: &str, position: &Position) -> Result<()>;

    /// Advance the entry for `name`. Fails with `NotTracked` if absent.
    async fn advance(&self, name: &str, position: &Position) -> Result<()>;

    /// Remove the entry for `name`. Removing an absent entry is not an error.
    async fn clear(&self, name: &str) -> Result<()>;
}

/// In-memory position store for tests and embedding.
#[derive(Default)]
pub struct MemoryTracker {
    entries: RwLock<HashMap<String, Position>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryTracker {
    async fn get(&self, name: &str) -> Result<Option<Position>> {
        Ok(self.entries.read().await.get(name).cloned())
    }

    async fn create(&self, name: &str, position: &Position) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(SyncError::AlreadyTracked(name.to_string()));
        }
        entries.insert(name.to_string(), position.clone());
        Ok(())
    }

    async fn advance(&self, name: &str, position: &Position) -> Result<()> {
        let mut entries = self.entries.write().await;
        let Some(current) = entries.get(name) else {
            return Err(SyncError::NotTracked(name.to_string()));
        };
        if position_regresses(current, position) {
            warn!(name, current = %current, requested = %position, "Refusing tracker regress");
            return Ok(());
        }
        entries.insert(name.to_string(), position.clone());
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<()> {
        self.entries.write().await.remove(name);
        Ok(())
    }
}

/// Positions never roll back; only comparable (same-kind numeric) pairs can
/// be checked, opaque cookies are replaced as issued.
fn position_regresses(current: &Position, requested: &Position) -> bool {
    matches!(
        current.partial_cmp(requested),
        Some(std::cmp::Ordering::Greater)
    )
}

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_CONSTRAINT_PRIMARYKEY = 1555, SQLITE_CONSTRAINT_UNIQUE = 2067
            if let Some(code) = db_err.code() {
                return code == "1555" || code == "2067";
            }
            db_err.message().to_lowercase().contains("unique constraint")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts, delay_ms, "SQLite busy, retrying"
                );
                crate::metrics::record_tracker_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent position store backed by SQLite.
///
/// WAL mode with `synchronous = NORMAL`: the tracker is advanced after every
/// applied record, and losing the last write on a crash only re-delivers one
/// already-applied record.
pub struct SqliteTracker {
    pool: SqlitePool,
    path: String,
}

impl SqliteTracker {
    /// Open (or create) the tracker database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening position tracker");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("invalid tracker path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await?;

        Self::init(pool, path_str).await
    }

    /// Open an in-memory tracker (tests, throwaway runs).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SyncError::Config(format!("invalid tracker options: {}", e)))?;

        // A second connection would see a different, empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracker (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                number INTEGER,
                cookie BLOB,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to the main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("tracker_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Position tracker closed");
    }

    fn row_to_position(kind: &str, number: Option<i64>, cookie: Option<Vec<u8>>) -> Result<Position> {
        match kind {
            "number" => number
                .map(|n| Position::Number(n as u64))
                .ok_or_else(|| SyncError::Internal("tracker row missing number".to_string())),
            "cookie" => cookie
                .map(Position::Cookie)
                .ok_or_else(|| SyncError::Internal("tracker row missing cookie".to_string())),
            other => Err(SyncError::Internal(format!(
                "unknown tracker position kind {:?}",
                other
            ))),
        }
    }

    fn position_to_row(position: &Position) -> (&'static str, Option<i64>, Option<&[u8]>) {
        match position {
            Position::Number(n) => ("number", Some(*n as i64), None),
            Position::Cookie(bytes) => ("cookie", None, Some(bytes.as_slice())),
        }
    }
}

#[async_trait]
impl PositionStore for SqliteTracker {
    async fn get(&self, name: &str) -> Result<Option<Position>> {
        let row: Option<(String, Option<i64>, Option<Vec<u8>>)> =
            sqlx::query_as("SELECT kind, number, cookie FROM tracker WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((kind, number, cookie)) => Ok(Some(Self::row_to_position(&kind, number, cookie)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, name: &str, position: &Position) -> Result<()> {
        let (kind, number, cookie) = Self::position_to_row(position);
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("tracker_create", || async {
            sqlx::query(
                "INSERT INTO tracker (name, kind, number, cookie, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(kind)
            .bind(number)
            .bind(cookie)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        match result {
            Ok(_) => {
                debug!(name, position = %position, "Tracker entry created");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(SyncError::AlreadyTracked(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn advance(&self, name: &str, position: &Position) -> Result<()> {
        let current = self
            .get(name)
            .await?
            .ok_or_else(|| SyncError::NotTracked(name.to_string()))?;

        if position_regresses(&current, position) {
            warn!(name, current = %current, requested = %position, "Refusing tracker regress");
            return Ok(());
        }

        let (kind, number, cookie) = Self::position_to_row(position);
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("tracker_advance", || async {
            sqlx::query(
                "UPDATE tracker SET kind = ?, number = ?, cookie = ?, updated_at = ? WHERE name = ?",
            )
            .bind(kind)
            .bind(number)
            .bind(cookie)
            .bind(now)
            .bind(name)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotTracked(name.to_string()));
        }

        debug!(name, position = %position, "Tracker advanced");
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("tracker_clear", || async {
            sqlx::query("DELETE FROM tracker WHERE name = ?")
                .bind(name)
                .execute(pool)
                .await
        })
        .await?;

        info!(name, "Tracker entry cleared");
        Ok(())
    }
}
