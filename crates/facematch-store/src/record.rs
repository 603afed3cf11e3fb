//! Probe result records, one per processed probe image.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to prepare database directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome recorded for one probe image. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: Uuid,
    pub image_id: String,
    /// Distinct matched identity labels, or the single "unknown" label.
    pub matched: Vec<String>,
    pub artifact_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(image_id: impl Into<String>, matched: Vec<String>, artifact_url: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_id: image_id.into(),
            matched,
            artifact_url,
            created_at: Utc::now(),
        }
    }
}

/// Persistence for [`ProbeResult`]s keyed by image identifier.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_image_id(&self, image_id: &str) -> Result<Option<ProbeResult>, StoreError>;

    /// Insert unless a record for the same image already exists.
    ///
    /// The check and the write are one atomic step; returns `false` when an
    /// existing record won.
    async fn insert(&self, record: &ProbeResult) -> Result<bool, StoreError>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<ProbeResult>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS probe_results (
    id           TEXT PRIMARY KEY,
    image_id     TEXT NOT NULL UNIQUE,
    matched      TEXT NOT NULL,
    artifact_url TEXT,
    created_at   TEXT NOT NULL
);
";

const SELECT_COLUMNS: &str = "SELECT id, image_id, matched, artifact_url, created_at FROM probe_results";

/// SQLite-backed record store.
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path.to_path_buf()).await?;
        tracing::info!(path = %path.display(), "opened record store");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<ProbeResult> {
    let id: String = row.get(0)?;
    let matched: String = row.get(2)?;
    let created_at: String = row.get(4)?;

    Ok(ProbeResult {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        image_id: row.get(1)?,
        matched: serde_json::from_str(&matched).map_err(|e| conversion_error(2, e))?,
        artifact_url: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| conversion_error(4, e))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find_by_image_id(&self, image_id: &str) -> Result<Option<ProbeResult>, StoreError> {
        let image_id = image_id.to_string();
        let found = self
            .conn
            .call(move |c| {
                let sql = format!("{SELECT_COLUMNS} WHERE image_id = ?1");
                Ok(c.query_row(&sql, params![image_id], row_to_result).optional()?)
            })
            .await?;
        Ok(found)
    }

    async fn insert(&self, record: &ProbeResult) -> Result<bool, StoreError> {
        let matched = serde_json::to_string(&record.matched)?;
        let record = record.clone();
        let inserted = self
            .conn
            .call(move |c| {
                let changed = c.execute(
                    "INSERT OR IGNORE INTO probe_results (id, image_id, matched, artifact_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.id.to_string(),
                        record.image_id,
                        matched,
                        record.artifact_url,
                        record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        Ok(inserted)
    }

    async fn list(&self) -> Result<Vec<ProbeResult>, StoreError> {
        let records = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at, image_id"))?;
                let rows = stmt.query_map([], row_to_result)?;
                let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }
}
