//! SQLite-backed record store.
//!
//! One row per pipeline; `data`, `logs` and `steps` are JSON text columns.
//! The table is created on first connection. Blocking database work runs on
//! the tokio blocking pool behind a shared connection mutex, and every
//! read-modify-write happens inside an immediate transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::warn;

use crate::domain::{PipelineData, PipelineRecord, PipelineStatus, RecordPatch};

use super::store::{sort_newest_first, PipelineStore, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pipelines (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        data TEXT NOT NULL,
        logs TEXT NOT NULL,
        steps TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS pipelines_created_at ON pipelines (created_at);
";

const SELECT_COLUMNS: &str =
    "SELECT id, created_at, updated_at, status, attempts, data, logs, steps FROM pipelines";

/// SQLite store sharing one connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::bootstrap(Connection::open(path)?)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking database work off the async executor
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Read-modify-write of one row inside an immediate transaction
    async fn modify<F>(&self, id: &str, f: F) -> Result<Option<PipelineRecord>, StoreError>
    where
        F: FnOnce(&mut PipelineRecord) -> Result<(), StoreError> + Send + 'static,
    {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut record) = select_one(&tx, &id)? else {
                return Ok(None);
            };
            f(&mut record)?;
            write_row(&tx, &record)?;
            tx.commit()?;
            Ok(Some(record))
        })
        .await
    }
}

/// Raw column values before JSON/timestamp decoding
struct RawRow {
    id: String,
    created_at: String,
    updated_at: String,
    status: String,
    attempts: i64,
    data: String,
    logs: String,
    steps: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            data: row.get(5)?,
            logs: row.get(6)?,
            steps: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<PipelineRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            location: format!("pipelines/{}", self.id),
            reason,
        };

        let status: PipelineStatus = self.status.parse().map_err(corrupt)?;
        let created_at = parse_timestamp(&self.created_at).map_err(corrupt)?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(corrupt)?;
        let data = serde_json::from_str(&self.data).map_err(|e| corrupt(e.to_string()))?;
        let logs = serde_json::from_str(&self.logs).map_err(|e| corrupt(e.to_string()))?;
        let steps = serde_json::from_str(&self.steps).map_err(|e| corrupt(e.to_string()))?;

        Ok(PipelineRecord {
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            id: self.id,
            created_at,
            updated_at,
            status,
            data,
            logs,
            steps,
        })
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

fn select_one(tx: &Transaction<'_>, id: &str) -> Result<Option<PipelineRecord>, StoreError> {
    let raw = tx
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            RawRow::from_row,
        )
        .optional()?;
    raw.map(RawRow::into_record).transpose()
}

fn insert_row(tx: &Transaction<'_>, record: &PipelineRecord) -> Result<bool, StoreError> {
    let changed = tx.execute(
        "INSERT OR IGNORE INTO pipelines (id, created_at, updated_at, status, attempts, data, logs, steps)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            format_timestamp(&record.created_at),
            format_timestamp(&record.updated_at),
            record.status.as_str(),
            record.attempts,
            serde_json::to_string(&record.data)?,
            serde_json::to_string(&record.logs)?,
            serde_json::to_string(&record.steps)?,
        ],
    )?;
    Ok(changed == 1)
}

/// Rewrite every mutable column; `data` and `created_at` are write-once
fn write_row(tx: &Transaction<'_>, record: &PipelineRecord) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE pipelines SET updated_at = ?2, status = ?3, attempts = ?4, logs = ?5, steps = ?6
         WHERE id = ?1",
        params![
            record.id,
            format_timestamp(&record.updated_at),
            record.status.as_str(),
            record.attempts,
            serde_json::to_string(&record.logs)?,
            serde_json::to_string(&record.steps)?,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl PipelineStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    params![id],
                    RawRow::from_row,
                )
                .optional()?;

            match raw.map(RawRow::into_record).transpose() {
                Ok(record) => Ok(record),
                Err(e) => {
                    warn!(pipeline_id = %id, error = %e, "Unreadable pipeline row");
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn create(&self, id: &str, data: PipelineData) -> Result<PipelineRecord, StoreError> {
        let record = PipelineRecord::new(id, data);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_row(&tx, &record)?;
            let stored = select_one(&tx, &record.id)?.ok_or_else(|| StoreError::Corrupt {
                location: format!("pipelines/{}", record.id),
                reason: "row missing after insert".to_string(),
            })?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        self.modify(id, move |record| Ok(record.apply_patch(patch)?))
            .await
    }

    async fn append_log(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        let message = message.to_string();
        self.modify(id, move |record| {
            record.push_log(message);
            Ok(())
        })
        .await
    }

    async fn annotate(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        let message = message.to_string();
        self.modify(id, move |record| {
            record.push_note(message);
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY created_at DESC", SELECT_COLUMNS))?;
            let rows = stmt.query_map([], RawRow::from_row)?;

            let mut records = Vec::new();
            for row in rows {
                match row?.into_record() {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(error = %e, "Skipping unreadable pipeline row"),
                }
            }

            sort_newest_first(&mut records);
            Ok(records)
        })
        .await
    }

    async fn insert_if_absent(&self, record: PipelineRecord) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = insert_row(&tx, &record)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }
}
