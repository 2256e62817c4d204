//! Data set monitor
//!
//! Drives the extraction worker on a fixed cadence. Passes never overlap:
//! the monitor owns the worker and awaits each pass before sleeping and
//! starting the next one.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::BatchHandler;
use crate::worker::{DataSetWorker, PassOutcome, WorkerError};

/// Logged when the monitor starts invoking worker passes.
pub const LOG_MESSAGE_STARTING_WORKER: &str = "Data set monitor started, scanning on schedule.";

/// Fixed-cadence driver for [`DataSetWorker`].
pub struct DataSetMonitor<H: BatchHandler> {
    worker: DataSetWorker<H>,
    cancel: CancellationToken,
}

impl<H: BatchHandler> DataSetMonitor<H> {
    pub fn new(worker: DataSetWorker<H>, cancel: CancellationToken) -> Self {
        Self { worker, cancel }
    }

    /// Invoke worker passes until cancelled or a pass fails. A fatal pass
    /// error is returned to the caller, which decides between logging and
    /// process exit.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!("{}", LOG_MESSAGE_STARTING_WORKER);

        loop {
            if self.cancel.is_cancelled() {
                info!("Data set monitor stopping.");
                return Ok(());
            }

            match self.worker.run_one_pass().await {
                Ok(PassOutcome::NoData) => {},
                Ok(PassOutcome::Completed(timestamp)) => {
                    info!(data_set = %timestamp, "Data set processed.");
                },
                Err(error) => return Err(error),
            }

            let scan_interval = self.worker.options().scan_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Data set monitor stopping.");
                    return Ok(());
                },
                _ = tokio::time::sleep(scan_interval) => {},
            }
        }
    }
}
