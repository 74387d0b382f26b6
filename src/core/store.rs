//! Durable record store contract.
//!
//! Every backend implements [`PipelineStore`]; the engine is written once
//! against the trait. Mutations commit before returning, and read-modify-write
//! operations on the same id never interleave.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreSettings};
use crate::domain::{InvalidTransition, PipelineData, PipelineRecord, RecordPatch};

use super::file_store::FileStore;
use super::sqlite_store::SqliteStore;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt store data at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Store task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// Persistence for pipeline records.
///
/// Operations addressed at an unknown id return `Ok(None)`; that is a normal
/// answer, not an error.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Short backend name for logs and the CLI
    fn backend(&self) -> &'static str;

    async fn get(&self, id: &str) -> Result<Option<PipelineRecord>, StoreError>;

    /// Create a `pending` record, or return the existing one untouched
    async fn create(&self, id: &str, data: PipelineData) -> Result<PipelineRecord, StoreError>;

    /// Apply a patch and refresh `updated_at`
    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<PipelineRecord>, StoreError>;

    /// Append a timestamped log entry and refresh `updated_at`
    async fn append_log(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError>;

    /// Append a log entry leaving every other field, `updated_at` included, as is
    async fn annotate(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError>;

    /// All records, newest `created_at` first
    async fn list(&self) -> Result<Vec<PipelineRecord>, StoreError>;

    /// Store a complete record verbatim unless the id exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, record: PipelineRecord) -> Result<bool, StoreError>;
}

/// Newest first; ties broken by id so listings are stable
pub(crate) fn sort_newest_first(records: &mut [PipelineRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Open the configured backend
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn PipelineStore>, StoreError> {
    let store: Arc<dyn PipelineStore> = match settings.backend {
        StoreBackend::File => Arc::new(FileStore::open(&settings.path).await?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&settings.database)?),
    };
    info!(backend = store.backend(), "Pipeline store ready");
    Ok(store)
}

/// Result of copying records between stores
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub inserted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Copy every record from `source` into `target`, skipping ids already present
pub async fn migrate(
    source: &dyn PipelineStore,
    target: &dyn PipelineStore,
) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport::default();

    for record in source.list().await? {
        let id = record.id.clone();
        if target.insert_if_absent(record).await? {
            info!(pipeline_id = %id, "Inserted");
            report.inserted.push(id);
        } else {
            info!(pipeline_id = %id, "Skipping existing");
            report.skipped.push(id);
        }
    }

    Ok(report)
}
