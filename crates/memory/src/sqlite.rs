//! SQLite persistence for the three memory layers.
//!
//! One database file, one table per layer. Each row keeps the record as JSON
//! (without its vector), the embedding as a little-endian f32 blob, and a few
//! scalar columns that are indexed for ordering and inspection.

use crate::vector::{from_blob, to_blob};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{
    EpisodicRecord, MemoryBackend, MemoryLayer, MemoryRecord, ProceduralStrategy, SemanticRule,
    StoredMemory,
};
use tracing::{debug, info, warn};

/// A SQLite memory backend in WAL mode.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) a database at `path`.
    ///
    /// Accepts a file path or a `sqlite:` URL. `sqlite::memory:` gives an
    /// ephemeral database on a single connection.
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let in_memory = path.contains(":memory:");
        let options = if path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(path)
                .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        MemoryError::Storage(format!("Cannot create {}: {e}", parent.display()))
                    })?;
                }
            }
            SqliteConnectOptions::new().filename(path)
        }
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        info!(path = %path, "SQLite memory backend initialized");
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        let statements = [
            (
                "episodes table",
                r#"
                CREATE TABLE IF NOT EXISTS episodes (
                    id          TEXT PRIMARY KEY,
                    session_id  TEXT NOT NULL,
                    timestamp   TEXT NOT NULL,
                    success     INTEGER NOT NULL,
                    importance  REAL NOT NULL,
                    data        TEXT NOT NULL,
                    embedding   BLOB
                )
                "#,
            ),
            (
                "rules table",
                r#"
                CREATE TABLE IF NOT EXISTS rules (
                    id          TEXT PRIMARY KEY,
                    updated_at  TEXT NOT NULL,
                    confidence  REAL NOT NULL,
                    data        TEXT NOT NULL,
                    embedding   BLOB
                )
                "#,
            ),
            (
                "strategies table",
                r#"
                CREATE TABLE IF NOT EXISTS strategies (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    priority    REAL NOT NULL,
                    data        TEXT NOT NULL,
                    embedding   BLOB
                )
                "#,
            ),
            (
                "episodes index",
                "CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp)",
            ),
            (
                "strategies index",
                "CREATE INDEX IF NOT EXISTS idx_strategies_name ON strategies(name)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MemoryError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn table(layer: MemoryLayer) -> &'static str {
        match layer {
            MemoryLayer::Episodic => "episodes",
            MemoryLayer::Semantic => "rules",
            MemoryLayer::Procedural => "strategies",
        }
    }

    /// Serialize a record without its vector.
    fn to_data<T: Serialize + Clone>(
        record: &T,
        clear: impl FnOnce(&mut T),
    ) -> Result<String, MemoryError> {
        let mut bare = record.clone();
        clear(&mut bare);
        serde_json::to_string(&bare)
            .map_err(|e| MemoryError::Storage(format!("Serialization failed: {e}")))
    }

    async fn load_table<T: DeserializeOwned>(
        &self,
        table: &str,
        order_by: &str,
        mut attach: impl FnMut(&mut T, Vec<f32>),
    ) -> Result<Vec<T>, MemoryError> {
        let sql = format!("SELECT id, data, embedding FROM {table} ORDER BY {order_by}");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("{table} scan: {e}")))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| MemoryError::QueryFailed(format!("id column: {e}")))?;
            let data: String = row
                .try_get("data")
                .map_err(|e| MemoryError::QueryFailed(format!("data column: {e}")))?;
            let blob: Option<Vec<u8>> = row.try_get("embedding").unwrap_or(None);

            match serde_json::from_str::<T>(&data) {
                Ok(mut record) => {
                    attach(&mut record, blob.as_deref().map(from_blob).unwrap_or_default());
                    out.push(record);
                }
                Err(e) => warn!(table, id = %id, error = %e, "Skipping unreadable memory row"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self) -> Result<StoredMemory, MemoryError> {
        let episodes = self
            .load_table::<EpisodicRecord>("episodes", "timestamp ASC", |r, v| r.embedding = v)
            .await?;
        let rules = self
            .load_table::<SemanticRule>("rules", "updated_at ASC", |r, v| r.embedding = v)
            .await?;
        let strategies = self
            .load_table::<ProceduralStrategy>("strategies", "name ASC", |r, v| r.embedding = v)
            .await?;

        debug!(
            episodes = episodes.len(),
            rules = rules.len(),
            strategies = strategies.len(),
            "Loaded memory from SQLite"
        );
        Ok(StoredMemory {
            episodes,
            rules,
            strategies,
        })
    }

    async fn persist(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        let result = match record {
            MemoryRecord::Episode(e) => {
                let data = Self::to_data(e, |r| r.embedding.clear())?;
                sqlx::query(
                    r#"
                    INSERT INTO episodes (id, session_id, timestamp, success, importance, data, embedding)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(id) DO UPDATE SET
                        importance = excluded.importance,
                        data = excluded.data,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&e.id)
                .bind(&e.session_id)
                .bind(e.timestamp.to_rfc3339())
                .bind(e.success)
                .bind(e.importance)
                .bind(data)
                .bind(to_blob(&e.embedding))
                .execute(&self.pool)
                .await
            }
            MemoryRecord::Rule(r) => {
                let data = Self::to_data(r, |r| r.embedding.clear())?;
                sqlx::query(
                    r#"
                    INSERT INTO rules (id, updated_at, confidence, data, embedding)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        updated_at = excluded.updated_at,
                        confidence = excluded.confidence,
                        data = excluded.data,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&r.id)
                .bind(r.updated_at.to_rfc3339())
                .bind(r.confidence)
                .bind(data)
                .bind(to_blob(&r.embedding))
                .execute(&self.pool)
                .await
            }
            MemoryRecord::Strategy(s) => {
                let data = Self::to_data(s, |r| r.embedding.clear())?;
                sqlx::query(
                    r#"
                    INSERT INTO strategies (id, name, priority, data, embedding)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        priority = excluded.priority,
                        data = excluded.data,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&s.id)
                .bind(&s.name)
                .bind(s.priority)
                .bind(data)
                .bind(to_blob(&s.embedding))
                .execute(&self.pool)
                .await
            }
        };

        result.map_err(|e| {
            MemoryError::Storage(format!("{} upsert failed: {e}", record.layer().as_str()))
        })?;
        Ok(())
    }

    async fn remove(&self, layer: MemoryLayer, id: &str) -> Result<bool, MemoryError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", Self::table(layer));
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("DELETE failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
