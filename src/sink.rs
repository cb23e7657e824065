use crate::error::PersistenceError;
use crate::register_map::MeterField;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Destination for successful samples.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Stores one reading and returns its row id. `None` timestamps mean now.
    async fn save(
        &self,
        device_id: &str,
        fields: &BTreeMap<MeterField, f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<i64, PersistenceError>;
}

/// Append-only reading store backed by SQLite.
#[derive(Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
    insert_sql: String,
}

impl SqliteSink {
    /// Opens (creating if needed) the database file and its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let sink = Self::from_pool(pool).await?;
        info!(path = %path.display(), "SQLite reading store ready");
        Ok(sink)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        // every pooled connection would otherwise get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, PersistenceError> {
        let sink = Self {
            pool,
            insert_sql: insert_statement(),
        };
        sink.init_schema().await?;
        Ok(sink)
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        let columns: String = MeterField::ALL
            .iter()
            .map(|field| format!(",\n    {} REAL", field.name()))
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS energy_readings (\n    \
             id INTEGER PRIMARY KEY AUTOINCREMENT,\n    \
             device_id TEXT NOT NULL,\n    \
             timestamp TEXT NOT NULL{columns}\n)"
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_energy_readings_device_time \
             ON energy_readings (device_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn insert_statement() -> String {
    let names: Vec<&str> = MeterField::ALL.iter().map(|f| f.name()).collect();
    let placeholders = vec!["?"; names.len() + 2].join(", ");
    format!(
        "INSERT INTO energy_readings (device_id, timestamp, {}) VALUES ({placeholders})",
        names.join(", ")
    )
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn save(
        &self,
        device_id: &str,
        fields: &BTreeMap<MeterField, f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<i64, PersistenceError> {
        if fields.is_empty() {
            return Err(PersistenceError::Rejected(format!(
                "reading for {device_id} has no values"
            )));
        }

        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let mut query = sqlx::query(&self.insert_sql)
            .bind(device_id)
            .bind(timestamp);
        for field in MeterField::ALL {
            query = query.bind(fields.get(&field).copied());
        }
        let id = query.execute(&self.pool).await?.last_insert_rowid();
        debug!(device_id, id, "Reading stored");
        Ok(id)
    }
}
