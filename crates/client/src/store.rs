//! Per-device key-value storage for the offline state blob.
//!
//! The engine only ever needs get/set/remove of a single serialized value under
//! a fixed key; `KeyValueStore` is that seam. `SqliteKeyValueStore` is the
//! on-device backend, `InMemoryKeyValueStore` serves tests and dev.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

/// Storage error surfaced at the `KeyValueStore` boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(format!("{err:#}"))
    }
}

/// Durable get/set of string blobs by key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

/// In-memory key-value store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current raw value, bypassing the async interface.
    pub fn raw(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Seed a raw value (e.g. a hand-written or corrupt blob in tests).
    pub fn insert_raw(&self, key: &str, value: impl Into<String>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.insert_raw(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Where a `SqliteKeyValueStore` keeps its data.
#[derive(Debug, Clone)]
enum SqliteLocation {
    File(PathBuf),
    Memory,
}

/// SQLite-backed key-value store.
///
/// This struct is cheap to clone and is safe to share across threads. The
/// database is opened lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    location: SqliteLocation,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteKeyValueStore {
    /// Store backed by the database file at `path` (created if missing).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SqliteLocation::File(path.into()),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Store backed by a private in-memory database (lost on drop).
    pub fn in_memory() -> Self {
        Self {
            location: SqliteLocation::Memory,
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Initialize the database connection (called lazily on first use).
    async fn get_pool(&self) -> anyhow::Result<SqlitePool> {
        let mut pool_guard = self.pool.lock().await;
        if let Some(pool) = pool_guard.as_ref() {
            return Ok(pool.clone());
        }

        let options = match &self.location {
            SqliteLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create store directory at {:?}", parent))?;
                }
                SqliteConnectOptions::new().filename(path).create_if_missing(true)
            }
            SqliteLocation::Memory => SqliteConnectOptions::new().in_memory(true),
        };

        // One long-lived connection: an in-memory database is private to its
        // connection and dies with it. The engine serializes writes anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite store at {:?}", self.location))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        *pool_guard = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let pool = self.get_pool().await?;

        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .context("failed to read from kv_store")?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value").context("invalid value column in kv_store")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let pool = self.get_pool().await?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key)
            DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .context("failed to upsert into kv_store")?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let pool = self.get_pool().await?;

        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await
            .context("failed to delete from kv_store")?;

        Ok(())
    }
}

/// Default on-device data directory: `{app_data_dir}/fieldsync`, falling
/// back to `~/.local/share/fieldsync` when the OS reports no data dir.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|base| base.join("fieldsync"))
}

/// Database file inside an explicit data directory.
pub fn db_path_in(dir: &Path) -> PathBuf {
    dir.join("offline.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_get_set_remove() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1".to_string()).await.unwrap();
        store.set("k", "v2".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_upserts_by_key() {
        let store = SqliteKeyValueStore::in_memory();

        store.set("state", "{\"a\":1}".to_string()).await.unwrap();
        store.set("state", "{\"a\":2}".to_string()).await.unwrap();
        store.set("other", "x".to_string()).await.unwrap();

        assert_eq!(store.get("state").await.unwrap().as_deref(), Some("{\"a\":2}"));

        store.remove("state").await.unwrap();
        assert_eq!(store.get("state").await.unwrap(), None);
        assert_eq!(store.get("other").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_handles() {
        let dir = std::env::temp_dir().join(format!("fieldsync-store-{}", uuid::Uuid::now_v7()));
        let path = db_path_in(&dir);

        {
            let store = SqliteKeyValueStore::open(&path);
            store.set("state", "kept".to_string()).await.unwrap();
        }

        let reopened = SqliteKeyValueStore::open(&path);
        assert_eq!(reopened.get("state").await.unwrap().as_deref(), Some("kept"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
