//! Data set extraction worker
//!
//! One [`DataSetWorker::run_one_pass`] call performs the full lifecycle for
//! at most one data set: scan the bucket for the oldest pending manifest,
//! wait until every file it declares has finished uploading, dispatch the
//! batch to the downstream loader, then relocate the data set's objects to
//! the completed prefix. Passes are expected to be driven serially by a
//! scheduler; the worker is never re-entered concurrently with itself.

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{BatchFile, BatchHandler, RecordBatch};
use crate::config::ExtractionOptions;
use crate::manifest::{
    self, completed_key, pending_key, DataSetManifest, ManifestError, MANIFEST_FILE_NAME,
};
use crate::storage::ObjectStore;

/// The maximum number of data set timestamps remembered by the duplicate
/// guard. Only bounds memory; it should err on the high side.
const MAX_EXPECTED_DATA_SETS_PENDING: usize = 10_000;

/// Delay between polls while waiting for a data set to finish uploading.
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Logged when a pass finds no data sets waiting to be processed.
pub const LOG_MESSAGE_NO_DATA_SETS: &str = "No data sets to process found.";

/// Logged when a pass finishes relocating a processed data set.
pub const LOG_MESSAGE_DATA_SET_COMPLETE: &str =
    "Data set relocated in S3, now that processing is complete.";

/// Fatal conditions that abort a worker pass. The caller decides whether to
/// log and continue or to exit.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A storage-gateway call failed. Could likely be retried, but retry is
    /// not supported in this design.
    #[error("storage operation failed: {0:#}")]
    Storage(#[source] anyhow::Error),

    /// An object matching the pending-manifest pattern had a malformed body.
    #[error("malformed manifest at '{key}': {source}")]
    ManifestParse {
        key: String,
        #[source]
        source: ManifestError,
    },

    /// The downstream loader rejected the batch; the data set is left
    /// un-relocated and eligible for re-selection.
    #[error("batch handler failed for data set {timestamp}: {source:#}")]
    Handler {
        timestamp: DateTime<Utc>,
        #[source]
        source: anyhow::Error,
    },

    /// Cancellation observed while waiting for a data set to finish
    /// uploading.
    #[error("cancelled while waiting for data set {timestamp} to finish uploading")]
    Cancelled { timestamp: DateTime<Utc> },
}

/// Outcome of a successful worker pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing eligible for processing was found.
    NoData,
    /// The data set with this timestamp was processed and relocated.
    Completed(DateTime<Utc>),
}

/// Bounded, insertion-ordered set of recently processed data set
/// timestamps. Relocation in storage is only eventually consistent, so this
/// guards against reprocessing a data set whose move is not yet visible. It
/// is not a source of truth and is not persisted.
pub struct RecentDataSets {
    capacity: usize,
    order: VecDeque<DateTime<Utc>>,
    members: HashSet<DateTime<Utc>>,
}

impl RecentDataSets {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.members.contains(&timestamp)
    }

    /// Record a timestamp, evicting the oldest member if at capacity.
    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        if !self.members.insert(timestamp) {
            return;
        }
        self.order.push_back(timestamp);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The extraction worker. Holds the storage gateway, the downstream batch
/// handler, and the in-memory duplicate guard.
pub struct DataSetWorker<H: BatchHandler> {
    options: ExtractionOptions,
    store: Arc<dyn ObjectStore>,
    handler: H,
    recently_processed: RecentDataSets,
    cancel: CancellationToken,
}

impl<H: BatchHandler> DataSetWorker<H> {
    pub fn new(
        options: ExtractionOptions,
        store: Arc<dyn ObjectStore>,
        handler: H,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            store,
            handler,
            recently_processed: RecentDataSets::new(MAX_EXPECTED_DATA_SETS_PENDING),
            cancel,
        }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Run one full scan-wait-dispatch-relocate pass. Processes at most one
    /// data set; returns [`PassOutcome::NoData`] when nothing is eligible.
    pub async fn run_one_pass(&mut self) -> Result<PassOutcome, WorkerError> {
        info!("Scanning for data sets to process...");

        let manifest = match self.scan_for_data_set().await? {
            Some(manifest) => manifest,
            None => {
                info!("{}", LOG_MESSAGE_NO_DATA_SETS);
                return Ok(PassOutcome::NoData);
            },
        };

        // The data set might still be uploading; wait until every file the
        // manifest declares is present.
        self.wait_until_available(&manifest).await?;

        info!("Data set ready. Processing it...");
        self.dispatch(&manifest).await?;

        // Two defenses against reprocessing: relocate the objects in
        // storage, and remember the timestamp in case the relocation is not
        // yet visible to the next scan.
        self.mark_data_set_complete(&manifest).await?;
        self.recently_processed.record(manifest.timestamp);

        Ok(PassOutcome::Completed(manifest.timestamp))
    }

    /// Enumerate the bucket and select the oldest pending data set that is
    /// neither recently processed nor rejected by the configured filter.
    async fn scan_for_data_set(&self) -> Result<Option<DataSetManifest>, WorkerError> {
        let keys = self
            .store
            .list_keys("")
            .await
            .map_err(WorkerError::Storage)?;

        let mut selected: Option<DataSetManifest> = None;
        let mut pending_manifests = 0;
        let mut completed_manifests = 0;

        for key in &keys {
            if let Some(id) = manifest::pending_manifest_id(key) {
                pending_manifests += 1;

                // The key looks like a manifest, but it also needs a valid
                // timestamp segment; otherwise it is not one of ours.
                let Some(timestamp) = manifest::parse_instant(id) else {
                    continue;
                };

                let manifest = self.read_manifest(key).await?;

                if self.recently_processed.contains(timestamp) {
                    debug!("Skipping data set that was already processed: {}", timestamp);
                    continue;
                }
                if !self.options.admits(&manifest) {
                    debug!("Skipping data set that doesn't pass filter: {:?}", manifest);
                    continue;
                }

                // Keep the oldest candidate; ties go to the first seen.
                match &selected {
                    Some(current) if timestamp >= current.timestamp => {},
                    _ => selected = Some(manifest),
                }
            } else if manifest::completed_manifest_id(key).is_some() {
                completed_manifests += 1;
            }
        }

        if let Some(manifest) = &selected {
            info!(
                "Found data set to process: '{}'. There were '{}' total pending data sets and '{}' completed ones.",
                manifest::format_instant(manifest.timestamp),
                pending_manifests,
                completed_manifests
            );
        }

        Ok(selected)
    }

    /// Fetch and deserialize a manifest body. A malformed manifest indicates
    /// a system-level problem, so failure here is fatal for the pass.
    async fn read_manifest(&self, key: &str) -> Result<DataSetManifest, WorkerError> {
        let body = self
            .store
            .get_object(key)
            .await
            .map_err(WorkerError::Storage)?;

        let xml = String::from_utf8_lossy(&body);
        DataSetManifest::parse(&xml).map_err(|source| WorkerError::ManifestParse {
            key: key.to_string(),
            source,
        })
    }

    /// Poll storage until every entry the manifest declares is present under
    /// the data set's pending prefix. There is deliberately no timeout; only
    /// cancellation ends the wait early.
    async fn wait_until_available(&self, manifest: &DataSetManifest) -> Result<(), WorkerError> {
        let mut logged_waiting = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(WorkerError::Cancelled {
                    timestamp: manifest.timestamp,
                });
            }

            if self.data_set_is_available(manifest).await? {
                return Ok(());
            }

            // Log the wait once, not on every poll.
            if !logged_waiting {
                info!(
                    "Data set not ready: '{}'. Waiting for it to finish uploading...",
                    manifest::format_instant(manifest.timestamp)
                );
                logged_waiting = true;
            }

            tokio::time::sleep(UPLOAD_POLL_INTERVAL).await;
        }
    }

    /// Check whether every file the manifest declares is present. Listing
    /// the prefix once beats probing per object, where each missing object
    /// would surface as an error.
    async fn data_set_is_available(
        &self,
        manifest: &DataSetManifest,
    ) -> Result<bool, WorkerError> {
        let prefix = manifest.pending_prefix();
        let keys = self
            .store
            .list_keys(&prefix)
            .await
            .map_err(WorkerError::Storage)?;

        let present: HashSet<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(|name| name.to_string())
            .collect();

        Ok(entries_all_present(manifest, &present))
    }

    /// Build the batch-ready event and invoke the downstream loader,
    /// blocking until it returns. Temp files fetched by the handler are
    /// released afterwards regardless of the outcome.
    async fn dispatch(&self, manifest: &DataSetManifest) -> Result<(), WorkerError> {
        let files: Vec<BatchFile> = manifest
            .entries
            .iter()
            .map(|entry| {
                BatchFile::new(
                    entry.file_type,
                    pending_key(manifest.timestamp, &entry.name),
                    Arc::clone(&self.store),
                )
            })
            .collect();

        let batch = RecordBatch {
            timestamp: manifest.timestamp,
            files,
        };

        let result = self.handler.on_batch_ready(&batch).await;

        for file in &batch.files {
            file.cleanup().await;
        }

        result.map_err(|source| WorkerError::Handler {
            timestamp: manifest.timestamp,
            source,
        })
    }

    /// Relocate the processed data set to the completed prefix: copy every
    /// object (preserving encryption settings), then batch-delete the
    /// sources. The backend has no atomic rename, so a failure part-way
    /// through leaves orphaned source objects behind; that risk is accepted.
    async fn mark_data_set_complete(
        &self,
        manifest: &DataSetManifest,
    ) -> Result<(), WorkerError> {
        let mut names: Vec<&str> = manifest.entries.iter().map(|e| e.name.as_str()).collect();
        names.push(MANIFEST_FILE_NAME);

        let source_keys: Vec<String> = names
            .iter()
            .map(|name| pending_key(manifest.timestamp, name))
            .collect();

        for (name, source_key) in names.iter().zip(&source_keys) {
            let target_key = completed_key(manifest.timestamp, name);
            self.store
                .copy_object(source_key, &target_key)
                .await
                .map_err(WorkerError::Storage)?;
        }
        debug!("Data set copied in S3 (step 1 of move).");

        self.store
            .delete_objects(&source_keys)
            .await
            .map_err(WorkerError::Storage)?;
        debug!("Data set deleted in S3 (step 2 of move).");

        info!("{}", LOG_MESSAGE_DATA_SET_COMPLETE);
        Ok(())
    }
}

/// True iff every entry name the manifest declares appears among the
/// relative object names present under the data set's prefix. Extra
/// unrelated objects do not affect the result.
fn entries_all_present(manifest: &DataSetManifest, present: &HashSet<String>) -> bool {
    manifest
        .entries
        .iter()
        .all(|entry| present.contains(&entry.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DataSetManifestEntry, RecordFileType};
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn test_recent_data_sets_bounded_eviction() {
        let mut recent = RecentDataSets::new(3);
        for i in 0..4 {
            recent.record(ts(i));
        }

        assert_eq!(recent.len(), 3);
        assert!(!recent.contains(ts(0)), "oldest entry should be evicted");
        assert!(recent.contains(ts(1)));
        assert!(recent.contains(ts(3)));
    }

    #[test]
    fn test_recent_data_sets_duplicate_insert_is_noop() {
        let mut recent = RecentDataSets::new(2);
        recent.record(ts(0));
        recent.record(ts(0));
        recent.record(ts(1));

        assert_eq!(recent.len(), 2);
        assert!(recent.contains(ts(0)));
        assert!(recent.contains(ts(1)));
    }

    #[test]
    fn test_entries_all_present() {
        let manifest = DataSetManifest::new(
            ts(0),
            0,
            vec![
                DataSetManifestEntry::new("a.rif", RecordFileType::Carrier),
                DataSetManifestEntry::new("b.rif", RecordFileType::Carrier),
            ],
        );

        let mut present: HashSet<String> =
            ["manifest.xml", "a.rif"].iter().map(|s| s.to_string()).collect();
        assert!(!entries_all_present(&manifest, &present));

        present.insert("b.rif".to_string());
        assert!(entries_all_present(&manifest, &present));

        // Unrelated extra objects under the prefix change nothing.
        present.insert("unrelated.tmp".to_string());
        assert!(entries_all_present(&manifest, &present));
    }
}
