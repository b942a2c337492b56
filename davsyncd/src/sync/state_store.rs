use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const STATE_FILE_NAME: &str = ".davsync.db";

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Baseline of one entry as observed at the end of the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub entry: String,
    pub modified: Option<i64>,
    pub etag: Option<String>,
}

/// Per-root table of `(parent, entry) -> (modified, etag)`.
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(sync_root: &Path) -> Result<Self, StateStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(state_file_path(sync_root))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn records(&self, parent: &str) -> Result<Vec<StateRecord>, StateStoreError> {
        let rows = sqlx::query(
            "SELECT entry, modified, etag FROM sync_entries WHERE parent = ?1 ORDER BY entry ASC",
        )
        .bind(parent)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StateRecord {
                entry: row.try_get("entry")?,
                modified: row.try_get("modified")?,
                etag: row.try_get("etag")?,
            });
        }
        Ok(out)
    }

    pub async fn record(
        &self,
        parent: &str,
        entry: &str,
    ) -> Result<Option<StateRecord>, StateStoreError> {
        let row = sqlx::query(
            "SELECT entry, modified, etag FROM sync_entries WHERE parent = ?1 AND entry = ?2",
        )
        .bind(parent)
        .bind(entry)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StateRecord {
            entry: row.try_get("entry")?,
            modified: row.try_get("modified")?,
            etag: row.try_get("etag")?,
        }))
    }

    pub async fn upsert(
        &self,
        parent: &str,
        entry: &str,
        modified: Option<i64>,
        etag: Option<&str>,
    ) -> Result<(), StateStoreError> {
        sqlx::query(
            "INSERT INTO sync_entries (parent, entry, modified, etag)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(parent, entry) DO UPDATE SET
                modified = excluded.modified,
                etag = excluded.etag",
        )
        .bind(parent)
        .bind(entry)
        .bind(modified)
        .bind(etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, parent: &str, entry: &str) -> Result<(), StateStoreError> {
        sqlx::query("DELETE FROM sync_entries WHERE parent = ?1 AND entry = ?2")
            .bind(parent)
            .bind(entry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops every row stored below the directory `path`.
    pub async fn remove_subtree(&self, path: &str) -> Result<(), StateStoreError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        sqlx::query(
            "DELETE FROM sync_entries WHERE parent = ?1 OR substr(parent, 1, ?3) = ?2",
        )
        .bind(path)
        .bind(&prefix)
        .bind(prefix.chars().count() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub fn state_file_path(sync_root: &Path) -> PathBuf {
    sync_root.join(STATE_FILE_NAME)
}
