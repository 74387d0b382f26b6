//! File-backed record store.
//!
//! All records live in one pretty-printed JSON document mapping id to record.
//! Writes are whole-file read-modify-write cycles: an in-process mutex plus an
//! exclusive `fs2` lock on a sidecar `.lock` file form the critical section,
//! and the new document replaces the old one through an fsync'd temp file and
//! an atomic rename. Readers never see a partial write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{PipelineData, PipelineRecord, RecordPatch};

use super::store::{sort_newest_first, PipelineStore, StoreError};

type Document = BTreeMap<String, PipelineRecord>;

/// JSON document store
pub struct FileStore {
    /// Path to the JSON document
    path: PathBuf,

    /// Serializes writers inside this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store, creating the directory and an empty document if needed
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        if fs::metadata(&path).await.is_err() {
            fs::write(&path, b"{}").await?;
            debug!(path = %path.display(), "Created empty pipeline store");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path to the JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document for reading. Failures degrade to an empty document.
    async fn read_document(&self) -> Document {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Document::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Error loading pipeline store");
                return Document::new();
            }
        };

        match parse_document(&self.path, &raw) {
            Ok(document) => document,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Error loading pipeline store");
                Document::new()
            }
        }
    }

    /// Run a read-modify-write cycle under the store lock.
    ///
    /// `f` returns the caller's value plus whether the document changed; an
    /// unchanged document is not rewritten.
    async fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Document) -> Result<(T, bool), StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let lock = OpenOptions::new()
                .create(true)
                .write(true)
                .open(lock_path(&path))?;
            lock.lock_exclusive()?;

            let mut document = load_for_write(&path)?;
            let (value, dirty) = f(&mut document)?;
            if dirty {
                persist(&path, &document)?;
            }

            // Lock is released when the file is dropped
            drop(lock);
            Ok(value)
        })
        .await?
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn parse_document(path: &Path, raw: &str) -> Result<Document, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Document::new());
    }
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        location: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Strict load: a corrupt document is an error so it is never overwritten
fn load_for_write(path: &Path) -> Result<Document, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => parse_document(path, &raw),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Document::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write the document durably: temp file in the same directory, fsync, rename
fn persist(path: &Path, document: &Document) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, document)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    // Make the rename itself durable where the platform allows it
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok(())
}

#[async_trait]
impl PipelineStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        Ok(self.read_document().await.remove(id))
    }

    async fn create(&self, id: &str, data: PipelineData) -> Result<PipelineRecord, StoreError> {
        let id = id.to_string();
        self.mutate(move |document| {
            if let Some(existing) = document.get(&id) {
                return Ok((existing.clone(), false));
            }
            let record = PipelineRecord::new(id.clone(), data);
            document.insert(id, record.clone());
            Ok((record, true))
        })
        .await
    }

    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        let id = id.to_string();
        self.mutate(move |document| {
            let Some(record) = document.get_mut(&id) else {
                return Ok((None, false));
            };
            record.apply_patch(patch)?;
            Ok((Some(record.clone()), true))
        })
        .await
    }

    async fn append_log(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        let id = id.to_string();
        let message = message.to_string();
        self.mutate(move |document| {
            let Some(record) = document.get_mut(&id) else {
                return Ok((None, false));
            };
            record.push_log(message);
            Ok((Some(record.clone()), true))
        })
        .await
    }

    async fn annotate(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        let id = id.to_string();
        let message = message.to_string();
        self.mutate(move |document| {
            let Some(record) = document.get_mut(&id) else {
                return Ok((None, false));
            };
            record.push_note(message);
            Ok((Some(record.clone()), true))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        let mut records: Vec<PipelineRecord> = self.read_document().await.into_values().collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn insert_if_absent(&self, record: PipelineRecord) -> Result<bool, StoreError> {
        self.mutate(move |document| {
            if document.contains_key(&record.id) {
                return Ok((false, false));
            }
            document.insert(record.id.clone(), record);
            Ok((true, true))
        })
        .await
    }
}
