//! End-to-end worker pass tests against an in-memory object store.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cdp_pipeline::batch::{BatchHandler, RecordBatch};
use cdp_pipeline::config::ExtractionOptions;
use cdp_pipeline::manifest::{DataSetManifest, DataSetManifestEntry, RecordFileType};
use cdp_pipeline::storage::ObjectStore;
use cdp_pipeline::worker::{DataSetWorker, PassOutcome, WorkerError};

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    kms_key_id: Option<String>,
}

/// In-memory stand-in for the S3 gateway. Keys are kept sorted, matching
/// S3's lexicographic listing order.
#[derive(Default)]
struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    fail_listing: AtomicBool,
}

impl MemoryStore {
    fn put(&self, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                kms_key_id: None,
            },
        );
    }

    fn put_encrypted(&self, key: &str, data: &[u8], kms_key_id: &str) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                kms_key_id: Some(kms_key_id.to_string()),
            },
        );
    }

    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn data_of(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    fn kms_key_of(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|o| o.kms_key_id.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("simulated listing failure");
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        match self.objects.lock().unwrap().get(key) {
            Some(object) => Ok(object.data.clone()),
            None => bail!("no such object: {}", key),
        }
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let Some(source) = objects.get(src_key).cloned() else {
            bail!("no such object: {}", src_key);
        };
        // The real gateway re-applies the source's SSE-KMS key on the copy.
        objects.insert(dst_key.to_string(), source);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}

type SeenBatch = (DateTime<Utc>, Vec<(RecordFileType, String, Vec<u8>)>);

/// Records every batch it is handed, reading each file through its temp
/// handle. Can be primed to fail the next dispatch.
#[derive(Clone, Default)]
struct RecordingHandler {
    seen: Arc<Mutex<Vec<SeenBatch>>>,
    fail_next: Arc<AtomicBool>,
}

#[async_trait]
impl BatchHandler for RecordingHandler {
    async fn on_batch_ready(&self, batch: &RecordBatch) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("simulated loader failure");
        }

        let mut files = Vec::new();
        for file in &batch.files {
            let path = file.fetch().await?;
            let data = std::fs::read(path)?;
            files.push((file.file_type(), file.key().to_string(), data));
        }
        self.seen.lock().unwrap().push((batch.timestamp, files));
        Ok(())
    }
}

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

fn carrier_manifest(timestamp: DateTime<Utc>, names: &[&str]) -> DataSetManifest {
    DataSetManifest::new(
        timestamp,
        0,
        names
            .iter()
            .map(|n| DataSetManifestEntry::new(*n, RecordFileType::Carrier))
            .collect(),
    )
}

/// Upload a manifest and all of its declared files under the pending prefix.
fn seed_data_set(store: &MemoryStore, manifest: &DataSetManifest) {
    store.put(
        &manifest.pending_manifest_key(),
        manifest.to_xml().unwrap().as_bytes(),
    );
    for entry in &manifest.entries {
        let key = format!("{}{}", manifest.pending_prefix(), entry.name);
        store.put(&key, format!("{} records", entry.name).as_bytes());
    }
}

fn worker_with(
    store: &Arc<MemoryStore>,
    handler: RecordingHandler,
    options: ExtractionOptions,
    cancel: CancellationToken,
) -> DataSetWorker<RecordingHandler> {
    DataSetWorker::new(
        options,
        Arc::clone(store) as Arc<dyn ObjectStore>,
        handler,
        cancel,
    )
}

#[tokio::test]
async fn empty_bucket_reports_no_data() {
    let store = Arc::new(MemoryStore::default());
    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let outcome = worker.run_one_pass().await.unwrap();

    assert_eq!(outcome, PassOutcome::NoData);
    assert!(handler.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_manifest_keys_are_ignored() {
    let store = Arc::new(MemoryStore::default());
    store.put("random.txt", b"noise");
    store.put("Incoming/2024-01-01T00:00:00Z/carrier.rif", b"orphan data");
    // Matches the pending pattern but the id segment is not an instant, so
    // it must be skipped without an error (the body is never even fetched).
    store.put("Incoming/not-a-timestamp/manifest.xml", b"whatever");

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let outcome = worker.run_one_pass().await.unwrap();

    assert_eq!(outcome, PassOutcome::NoData);
    assert_eq!(store.keys().len(), 3, "nothing may be relocated");
}

#[tokio::test]
async fn processes_complete_data_set() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif", "b.rif"]);
    seed_data_set(&store, &manifest);

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let outcome = worker.run_one_pass().await.unwrap();
    assert_eq!(outcome, PassOutcome::Completed(ts(0)));

    // The handler saw both files, with the uploaded bytes.
    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (timestamp, files) = &seen[0];
    assert_eq!(*timestamp, ts(0));
    assert_eq!(files.len(), 2);
    assert!(files
        .iter()
        .any(|(t, k, d)| *t == RecordFileType::Carrier
            && k == "Incoming/2024-01-01T00:00:00Z/a.rif"
            && d == b"a.rif records"));

    // Every object moved to Done/, byte-identical, and Incoming/ is empty.
    assert_eq!(
        store.keys(),
        vec![
            "Done/2024-01-01T00:00:00Z/a.rif".to_string(),
            "Done/2024-01-01T00:00:00Z/b.rif".to_string(),
            "Done/2024-01-01T00:00:00Z/manifest.xml".to_string(),
        ]
    );
    assert_eq!(
        store.data_of("Done/2024-01-01T00:00:00Z/a.rif").unwrap(),
        b"a.rif records"
    );
    assert_eq!(
        store.data_of("Done/2024-01-01T00:00:00Z/manifest.xml").unwrap(),
        manifest.to_xml().unwrap().as_bytes()
    );

    // Nothing pending remains for the next pass.
    let outcome = worker.run_one_pass().await.unwrap();
    assert_eq!(outcome, PassOutcome::NoData);
}

#[tokio::test]
async fn oldest_data_set_is_selected_first() {
    let store = Arc::new(MemoryStore::default());
    let newer = carrier_manifest(ts(2), &["late.rif"]);
    let older = carrier_manifest(ts(1), &["early.rif"]);
    seed_data_set(&store, &newer);
    seed_data_set(&store, &older);

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    assert_eq!(
        worker.run_one_pass().await.unwrap(),
        PassOutcome::Completed(ts(1))
    );
    // The newer batch is untouched until its turn comes.
    assert!(store
        .keys()
        .contains(&"Incoming/2024-01-01T02:00:00Z/manifest.xml".to_string()));

    assert_eq!(
        worker.run_one_pass().await.unwrap(),
        PassOutcome::Completed(ts(2))
    );

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen[0].0, ts(1));
    assert_eq!(seen[1].0, ts(2));
}

#[tokio::test]
async fn incomplete_data_set_is_waited_on_not_processed() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif", "b.rif"]);
    store.put(
        &manifest.pending_manifest_key(),
        manifest.to_xml().unwrap().as_bytes(),
    );
    store.put("Incoming/2024-01-01T00:00:00Z/a.rif", b"a.rif records");
    // b.rif never arrives.

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    // The pass keeps polling; there is deliberately no timeout of its own.
    let result =
        tokio::time::timeout(Duration::from_millis(300), worker.run_one_pass()).await;
    assert!(result.is_err(), "the pass must still be waiting");

    assert!(handler.seen.lock().unwrap().is_empty());
    assert_eq!(store.keys().len(), 2, "nothing may be relocated");
}

#[tokio::test]
async fn cancellation_during_wait_is_fatal() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    store.put(
        &manifest.pending_manifest_key(),
        manifest.to_xml().unwrap().as_bytes(),
    );
    // The declared file never arrives, so the pass will enter the wait loop.

    let cancel = CancellationToken::new();
    cancel.cancel();

    let handler = RecordingHandler::default();
    let mut worker = worker_with(&store, handler.clone(), ExtractionOptions::new(), cancel);

    let error = worker.run_one_pass().await.unwrap_err();
    assert!(matches!(
        error,
        WorkerError::Cancelled { timestamp } if timestamp == ts(0)
    ));
    assert!(handler.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn filtered_out_data_set_is_skipped() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    seed_data_set(&store, &manifest);

    let handler = RecordingHandler::default();
    let options = ExtractionOptions::new().with_allowed_file_type(RecordFileType::Beneficiary);
    let mut worker = worker_with(&store, handler.clone(), options, CancellationToken::new());

    let outcome = worker.run_one_pass().await.unwrap();

    assert_eq!(outcome, PassOutcome::NoData);
    assert!(handler.seen.lock().unwrap().is_empty());
    assert_eq!(store.keys().len(), 2, "nothing may be relocated");
}

#[tokio::test]
async fn recently_processed_data_set_is_not_reprocessed() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    seed_data_set(&store, &manifest);

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    assert_eq!(
        worker.run_one_pass().await.unwrap(),
        PassOutcome::Completed(ts(0))
    );

    // Simulate eventual consistency: the relocated objects reappear under
    // the pending prefix as if the move were not yet visible.
    seed_data_set(&store, &manifest);

    assert_eq!(worker.run_one_pass().await.unwrap(), PassOutcome::NoData);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_manifest_aborts_the_pass() {
    let store = Arc::new(MemoryStore::default());
    store.put(
        "Incoming/2024-01-01T00:00:00Z/manifest.xml",
        b"<dataSetManifest>this is not a valid manifest",
    );

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let error = worker.run_one_pass().await.unwrap_err();
    assert!(matches!(
        error,
        WorkerError::ManifestParse { ref key, .. }
            if key == "Incoming/2024-01-01T00:00:00Z/manifest.xml"
    ));
}

#[tokio::test]
async fn encryption_key_reference_survives_relocation() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    store.put_encrypted(
        &manifest.pending_manifest_key(),
        manifest.to_xml().unwrap().as_bytes(),
        "alias/cdp-data",
    );
    store.put_encrypted(
        "Incoming/2024-01-01T00:00:00Z/a.rif",
        b"a.rif records",
        "alias/cdp-data",
    );

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler,
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    worker.run_one_pass().await.unwrap();

    assert_eq!(
        store.kms_key_of("Done/2024-01-01T00:00:00Z/a.rif").as_deref(),
        Some("alias/cdp-data")
    );
    assert_eq!(
        store
            .kms_key_of("Done/2024-01-01T00:00:00Z/manifest.xml")
            .as_deref(),
        Some("alias/cdp-data")
    );
}

#[tokio::test]
async fn handler_failure_leaves_data_set_pending() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    seed_data_set(&store, &manifest);

    let handler = RecordingHandler::default();
    handler.fail_next.store(true, Ordering::SeqCst);
    let mut worker = worker_with(
        &store,
        handler.clone(),
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let error = worker.run_one_pass().await.unwrap_err();
    assert!(matches!(
        error,
        WorkerError::Handler { timestamp, .. } if timestamp == ts(0)
    ));

    // Not marked complete: still pending, eligible for a later pass.
    assert!(store
        .keys()
        .iter()
        .all(|k| k.starts_with("Incoming/")));

    assert_eq!(
        worker.run_one_pass().await.unwrap(),
        PassOutcome::Completed(ts(0))
    );
}

#[tokio::test]
async fn storage_failure_is_fatal() {
    let store = Arc::new(MemoryStore::default());
    store.fail_listing.store(true, Ordering::SeqCst);

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler,
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    let error = worker.run_one_pass().await.unwrap_err();
    assert!(matches!(error, WorkerError::Storage(_)));
}

#[tokio::test]
async fn unrelated_objects_under_prefix_do_not_block_availability() {
    let store = Arc::new(MemoryStore::default());
    let manifest = carrier_manifest(ts(0), &["a.rif"]);
    seed_data_set(&store, &manifest);
    store.put("Incoming/2024-01-01T00:00:00Z/scratch.tmp", b"leftover");

    let handler = RecordingHandler::default();
    let mut worker = worker_with(
        &store,
        handler,
        ExtractionOptions::new(),
        CancellationToken::new(),
    );

    assert_eq!(
        worker.run_one_pass().await.unwrap(),
        PassOutcome::Completed(ts(0))
    );

    // Only declared entries plus the manifest are relocated; the stray
    // object stays behind.
    assert_eq!(
        store.keys(),
        vec![
            "Done/2024-01-01T00:00:00Z/a.rif".to_string(),
            "Done/2024-01-01T00:00:00Z/manifest.xml".to_string(),
            "Incoming/2024-01-01T00:00:00Z/scratch.tmp".to_string(),
        ]
    );
}
