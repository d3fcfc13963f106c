use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::metadata::SourceInfo;
use crate::utils::Result;

/// Persistent url → {mime, length} store.
///
/// Lookups never fail: a broken store degrades to "unknown metadata" so the
/// caller simply probes the network again.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, url: &str) -> Option<SourceInfo>;

    async fn put(&self, url: &str, info: SourceInfo) -> Result<()>;

    async fn release(&self);
}

/// Storage kept entirely in memory; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    infos: RwLock<HashMap<String, SourceInfo>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, url: &str) -> Option<SourceInfo> {
        match self.infos.read() {
            Ok(infos) => infos.get(url).cloned(),
            Err(e) => {
                warn!("Source info map poisoned: {}", e);
                None
            }
        }
    }

    async fn put(&self, url: &str, info: SourceInfo) -> Result<()> {
        if let Ok(mut infos) = self.infos.write() {
            infos.insert(url.to_string(), info);
        }
        Ok(())
    }

    async fn release(&self) {
        if let Ok(mut infos) = self.infos.write() {
            infos.clear();
        }
    }
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS cached_file_info (
    url TEXT PRIMARY KEY NOT NULL,
    mime TEXT,
    length INTEGER
)";

/// SQLite-backed storage with an in-memory shadow for hot lookups.
#[derive(Debug)]
pub struct SqliteStorage {
    pool: SqlitePool,
    infos: RwLock<HashMap<String, SourceInfo>>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Opening source info database at {:?}", path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly useful for tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            infos: RwLock::new(HashMap::new()),
        })
    }

    fn shadow(&self, url: &str) -> Option<SourceInfo> {
        self.infos.read().ok().and_then(|infos| infos.get(url).cloned())
    }

    fn remember(&self, url: &str, info: SourceInfo) {
        if let Ok(mut infos) = self.infos.write() {
            infos.insert(url.to_string(), info);
        }
    }

    async fn load(&self, url: &str) -> Result<Option<SourceInfo>> {
        let row: Option<(String, Option<String>, i64)> =
            sqlx::query_as("SELECT url, mime, length FROM cached_file_info WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(url, mime, length)| SourceInfo::from_columns(url, mime, length)))
    }
}

#[async_trait]
impl CacheStorage for SqliteStorage {
    async fn get(&self, url: &str) -> Option<SourceInfo> {
        if let Some(info) = self.shadow(url) {
            return Some(info);
        }

        match self.load(url).await {
            Ok(Some(info)) => {
                self.remember(url, info.clone());
                Some(info)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load source info for {}: {}", url, e);
                None
            }
        }
    }

    async fn put(&self, url: &str, info: SourceInfo) -> Result<()> {
        if self.get(url).await.as_ref() == Some(&info) {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO cached_file_info (url, mime, length) VALUES (?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET mime = excluded.mime, length = excluded.length",
        )
        .bind(url)
        .bind(&info.mime)
        .bind(info.length_column())
        .execute(&self.pool)
        .await?;

        debug!("Stored source info {}", info);
        self.remember(url, info);
        Ok(())
    }

    async fn release(&self) {
        self.pool.close().await;
    }
}
