//! CDP Pipeline - S3 data set extraction monitor

use anyhow::Result;
use async_trait::async_trait;
use cdp_common::logging::{init_logging, LogConfig, LogLevel};
use cdp_pipeline::batch::{BatchHandler, RecordBatch};
use cdp_pipeline::config::ExtractionOptions;
use cdp_pipeline::scheduler::DataSetMonitor;
use cdp_pipeline::storage::{config::StorageConfig, S3Store};
use cdp_pipeline::worker::DataSetWorker;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cdp-pipeline")]
#[command(author, version, about = "CDP S3 data set extraction monitor")]
struct Cli {
    /// S3 bucket to watch (overrides CDP_S3_BUCKET)
    #[arg(short, long)]
    bucket: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Placeholder loader: fetches each file of the batch and logs it. The real
/// ETL engine plugs in here through [`BatchHandler`].
struct LoggingBatchHandler;

#[async_trait]
impl BatchHandler for LoggingBatchHandler {
    async fn on_batch_ready(&self, batch: &RecordBatch) -> Result<()> {
        for file in &batch.files {
            let path = file.fetch().await?;
            info!(
                key = %file.key(),
                file_type = ?file.file_type(),
                local = %path.display(),
                "Fetched batch file"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cdp-pipeline".to_string())
        .build();

    // Environment variables take precedence over CLI defaults.
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    let mut storage_config = StorageConfig::from_env()?;
    if let Some(bucket) = cli.bucket {
        storage_config.bucket = bucket;
    }

    let options = ExtractionOptions::from_env()?;
    let store = S3Store::new(storage_config).await?;

    let cancel = CancellationToken::new();
    let worker = DataSetWorker::new(
        options,
        Arc::new(store),
        LoggingBatchHandler,
        cancel.clone(),
    );
    let monitor = DataSetMonitor::new(worker, cancel.clone());

    // Stop between passes on ctrl-c; an interrupt during a pass surfaces
    // through the worker's cancellation check.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received.");
            cancel.cancel();
        }
    });

    if let Err(e) = monitor.run().await {
        error!(error = %e, "Data set monitor failed");
        return Err(e.into());
    }

    info!("Data set monitor exited.");
    Ok(())
}
