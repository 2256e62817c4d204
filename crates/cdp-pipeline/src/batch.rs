//! Batch-ready events handed to the downstream loader
//!
//! Once a data set is fully uploaded, the worker wraps each manifest entry in
//! a [`BatchFile`] handle and hands the whole [`RecordBatch`] to the
//! [`BatchHandler`] (the downstream record loader). Handles fetch object
//! bytes into a temp file on demand; the worker releases those temp files
//! after dispatch whether or not the handler succeeded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::manifest::RecordFileType;
use crate::storage::ObjectStore;

/// Handle to one record file of a pending data set.
pub struct BatchFile {
    file_type: RecordFileType,
    key: String,
    store: Arc<dyn ObjectStore>,
    local: Mutex<Option<NamedTempFile>>,
}

impl BatchFile {
    pub fn new(file_type: RecordFileType, key: String, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            file_type,
            key,
            store,
            local: Mutex::new(None),
        }
    }

    pub fn file_type(&self) -> RecordFileType {
        self.file_type
    }

    /// The object key this handle is bound to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Download the object into a local temp file, once, and return its
    /// path. Subsequent calls reuse the same file.
    pub async fn fetch(&self) -> Result<PathBuf> {
        let mut local = self.local.lock().await;
        if let Some(temp) = local.as_ref() {
            return Ok(temp.path().to_path_buf());
        }

        let data = self.store.get_object(&self.key).await?;
        let mut temp = NamedTempFile::new().context("Failed to create temp file")?;
        temp.write_all(&data)
            .context("Failed to write temp file")?;

        let path = temp.path().to_path_buf();
        *local = Some(temp);
        Ok(path)
    }

    /// Release the local temp file, if one was fetched. Safe to call when
    /// nothing was fetched.
    pub async fn cleanup(&self) {
        self.local.lock().await.take();
    }
}

impl std::fmt::Debug for BatchFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFile")
            .field("file_type", &self.file_type)
            .field("key", &self.key)
            .finish()
    }
}

/// The batch-ready event: a data set's timestamp plus a handle per declared
/// file. Owned by the downstream loader for the duration of the dispatch
/// call.
#[derive(Debug)]
pub struct RecordBatch {
    pub timestamp: DateTime<Utc>,
    pub files: Vec<BatchFile>,
}

/// The downstream record loader boundary.
///
/// `on_batch_ready` is invoked synchronously per batch; the worker blocks
/// until it returns so that at most one data set is ever in flight.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn on_batch_ready(&self, batch: &RecordBatch) -> Result<()>;
}
