//! Persisted status records.
//!
//! The synchronizer depends only on [`StatusStore::load_status`] and
//! [`StatusStore::save_status`]; `list_status` serves the HTTP API.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tokio::sync::RwLock;

/// Latest known presence of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub subject_id: String,
    pub present: bool,
    /// `emittedAt` of the event that produced this record, epoch ms.
    pub updated_at: i64,
    pub source_identity: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Busy, locked, or unreachable. Worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// SQLite primary result codes for "try again later".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                true
            }
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            _ => false,
        };

        if transient {
            Self::Unavailable(e.to_string())
        } else {
            Self::Backend(e.to_string())
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load_status(&self, subject_id: &str) -> Result<Option<StatusRecord>, StorageError>;

    /// Write `record`. Implementations keep whichever of the stored and the
    /// new record has the later `updated_at` (ties go to the new one).
    async fn save_status(&self, record: &StatusRecord) -> Result<(), StorageError>;

    async fn list_status(&self) -> Result<Vec<StatusRecord>, StorageError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/presence/presence.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database gets its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<StatusRecord, sqlx::Error> {
    Ok(StatusRecord {
        subject_id: row.try_get("subject_id")?,
        present: row.try_get("present")?,
        updated_at: row.try_get("updated_at")?,
        source_identity: row.try_get("source_identity")?,
    })
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn load_status(&self, subject_id: &str) -> Result<Option<StatusRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT subject_id, present, updated_at, source_identity
            FROM status
            WHERE subject_id = ?
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn save_status(&self, record: &StatusRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO status (subject_id, present, updated_at, source_identity)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(subject_id) DO UPDATE SET
              present=excluded.present,
              updated_at=excluded.updated_at,
              source_identity=excluded.source_identity
            WHERE excluded.updated_at >= status.updated_at
            "#,
        )
        .bind(&record.subject_id)
        .bind(record.present)
        .bind(record.updated_at)
        .bind(&record.source_identity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_status(&self) -> Result<Vec<StatusRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT subject_id, present, updated_at, source_identity
            FROM status
            ORDER BY subject_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(record_from_row).collect::<Result<_, _>>()?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, StatusRecord>>,
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn load_status(&self, subject_id: &str) -> Result<Option<StatusRecord>, StorageError> {
        Ok(self.records.read().await.get(subject_id).cloned())
    }

    async fn save_status(&self, record: &StatusRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        match records.get(&record.subject_id) {
            Some(existing) if existing.updated_at > record.updated_at => {}
            _ => {
                records.insert(record.subject_id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn list_status(&self) -> Result<Vec<StatusRecord>, StorageError> {
        let mut all: Vec<StatusRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        Ok(all)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str, present: bool, updated_at: i64) -> StatusRecord {
        StatusRecord {
            subject_id: subject.into(),
            present,
            updated_at,
            source_identity: "AA:BB:CC:DD:EE:FF".into(),
        }
    }

    async fn sqlite() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    /// Behaviour every store must share.
    async fn exercise(store: &dyn StatusStore) {
        assert_eq!(store.load_status("3").await.unwrap(), None);

        store.save_status(&record("3", true, 1_000)).await.unwrap();
        assert_eq!(store.load_status("3").await.unwrap(), Some(record("3", true, 1_000)));

        // Newer wins.
        store.save_status(&record("3", false, 2_000)).await.unwrap();
        assert_eq!(store.load_status("3").await.unwrap(), Some(record("3", false, 2_000)));

        // Older is ignored.
        store.save_status(&record("3", true, 1_500)).await.unwrap();
        assert_eq!(store.load_status("3").await.unwrap(), Some(record("3", false, 2_000)));

        // Equal timestamp is written.
        store.save_status(&record("3", true, 2_000)).await.unwrap();
        assert_eq!(store.load_status("3").await.unwrap(), Some(record("3", true, 2_000)));

        store.save_status(&record("1", false, 10)).await.unwrap();
        let all = store.list_status().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemoryStore::default()).await;
    }

    #[tokio::test]
    async fn sqlite_store_semantics() {
        exercise(&sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_round_trips_present_flag() {
        let store = sqlite().await;
        store.save_status(&record("a", true, 5)).await.unwrap();
        store.save_status(&record("b", false, 5)).await.unwrap();
        assert!(store.load_status("a").await.unwrap().unwrap().present);
        assert!(!store.load_status("b").await.unwrap().unwrap().present);
    }

    #[tokio::test]
    async fn unmigrated_database_is_a_backend_error() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let err = store.load_status("3").await.unwrap_err();
        assert!(!err.is_transient(), "got {err:?}");
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(StorageError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StorageError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
