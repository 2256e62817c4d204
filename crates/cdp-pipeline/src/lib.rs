//! CDP Pipeline Library
//!
//! Extraction side of the claims data pipeline: watches an S3 bucket for
//! pending data sets, waits for each one to finish uploading, dispatches the
//! complete batch to a downstream record loader, then relocates the data
//! set's objects to the completed prefix.
//!
//! # Example
//!
//! ```no_run
//! use cdp_pipeline::config::ExtractionOptions;
//! use cdp_pipeline::scheduler::DataSetMonitor;
//! use cdp_pipeline::storage::{config::StorageConfig, S3Store};
//! use cdp_pipeline::worker::DataSetWorker;
//! use cdp_pipeline::batch::{BatchHandler, RecordBatch};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct MyLoader;
//!
//! #[async_trait::async_trait]
//! impl BatchHandler for MyLoader {
//!     async fn on_batch_ready(&self, batch: &RecordBatch) -> anyhow::Result<()> {
//!         // load records into the database here
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = S3Store::new(StorageConfig::from_env()?).await?;
//!     let cancel = CancellationToken::new();
//!     let worker = DataSetWorker::new(
//!         ExtractionOptions::from_env()?,
//!         Arc::new(store),
//!         MyLoader,
//!         cancel.clone(),
//!     );
//!     DataSetMonitor::new(worker, cancel).run().await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod manifest;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use batch::{BatchFile, BatchHandler, RecordBatch};
pub use config::ExtractionOptions;
pub use manifest::{DataSetManifest, DataSetManifestEntry, RecordFileType};
pub use worker::{DataSetWorker, PassOutcome, WorkerError};
