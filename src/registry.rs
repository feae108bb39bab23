//! Registry of day-partitioned CSV files.
//!
//! The registry is the ground truth for "has this day's CSV been started".
//! A header row is written to a day file only when its `dateKey` was absent
//! from the registry at the moment the file was first opened, which keeps
//! headers unique across restarts without inspecting file contents.
//!
//! # Implementations
//!
//! | Type | Backing store |
//! |------|---------------|
//! | [`SqliteRegistry`] | `day_files` table in the SQLite registry database |
//! | [`InMemoryRegistry`] | `Vec` behind a `RwLock`, for tests |

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::RwLock;

use crate::models::RegistryEntry;

/// Persistent mapping from a day key to its CSV file metadata.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Returns `true` iff an entry for `date_key` is present.
    async fn exists(&self, date_key: &str) -> Result<bool>;

    /// Inserts `{date_key, date_key.csv, now}` unless the key is already present.
    ///
    /// Returns `true` when a new entry was created.
    async fn put(&self, date_key: &str) -> Result<bool>;

    /// Looks up a single entry.
    async fn get(&self, date_key: &str) -> Result<Option<RegistryEntry>>;

    /// Returns every entry in insertion order.
    async fn list_all(&self) -> Result<Vec<RegistryEntry>>;
}

pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> RegistryEntry {
    RegistryEntry {
        date_key: row.get("date_key"),
        file_name: row.get("file_name"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn exists(&self, date_key: &str) -> Result<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM day_files WHERE date_key = ?")
                .bind(date_key)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn put(&self, date_key: &str) -> Result<bool> {
        let entry = RegistryEntry::new(date_key, Utc::now().timestamp_millis());
        let result = sqlx::query(
            r#"
            INSERT INTO day_files (date_key, file_name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(date_key) DO NOTHING
            "#,
        )
        .bind(&entry.date_key)
        .bind(&entry.file_name)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, date_key: &str) -> Result<Option<RegistryEntry>> {
        let row = sqlx::query(
            "SELECT date_key, file_name, created_at FROM day_files WHERE date_key = ?",
        )
        .bind(date_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_entry))
    }

    async fn list_all(&self) -> Result<Vec<RegistryEntry>> {
        let rows =
            sqlx::query("SELECT date_key, file_name, created_at FROM day_files ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().map(row_to_entry).collect())
    }
}

/// In-memory registry for tests.
pub struct InMemoryRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn exists(&self, date_key: &str) -> Result<bool> {
        let entries = self.entries.read().unwrap();
        Ok(entries.iter().any(|e| e.date_key == date_key))
    }

    async fn put(&self, date_key: &str) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|e| e.date_key == date_key) {
            return Ok(false);
        }
        entries.push(RegistryEntry::new(date_key, Utc::now().timestamp_millis()));
        Ok(true)
    }

    async fn get(&self, date_key: &str) -> Result<Option<RegistryEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries.iter().find(|e| e.date_key == date_key).cloned())
    }

    async fn list_all(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.entries.read().unwrap().clone())
    }
}
