//! Extraction worker configuration

use cdp_common::{CdpError, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::manifest::{DataSetManifest, RecordFileType};

/// Predicate deciding whether a pending data set is admitted for processing.
pub type DataSetFilter = Arc<dyn Fn(&DataSetManifest) -> bool + Send + Sync>;

/// Options held by the extraction worker and its scheduler.
#[derive(Clone)]
pub struct ExtractionOptions {
    filter: DataSetFilter,
    scan_interval: Duration,
}

impl ExtractionOptions {
    /// Options that admit every data set, scanning once per second.
    pub fn new() -> Self {
        Self {
            filter: Arc::new(|_| true),
            scan_interval: Duration::from_secs(1),
        }
    }

    /// Load options from environment variables:
    ///
    /// - `CDP_ALLOWED_RECORD_TYPE`: only process data sets whose entries all
    ///   carry this record type (optional; default admits everything)
    /// - `CDP_SCAN_INTERVAL_SECS`: delay between scheduler passes
    pub fn from_env() -> Result<Self> {
        let mut options = Self::new();

        if let Ok(allowed) = env::var("CDP_ALLOWED_RECORD_TYPE") {
            let file_type: RecordFileType = allowed
                .parse()
                .map_err(|_| CdpError::Config(format!("Invalid record type: {}", allowed)))?;
            options = options.with_allowed_file_type(file_type);
        }

        if let Ok(secs) = env::var("CDP_SCAN_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                CdpError::Config(format!("Invalid scan interval: {}", secs))
            })?;
            options.scan_interval = Duration::from_secs(secs);
        }

        Ok(options)
    }

    /// Restrict processing to data sets whose entries all carry the given
    /// record type.
    pub fn with_allowed_file_type(mut self, file_type: RecordFileType) -> Self {
        self.filter = Arc::new(move |manifest: &DataSetManifest| {
            manifest.entries.iter().all(|e| e.file_type == file_type)
        });
        self
    }

    /// Replace the data set filter with an arbitrary predicate.
    pub fn with_filter(
        mut self,
        filter: impl Fn(&DataSetManifest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Whether the filter admits this manifest.
    pub fn admits(&self, manifest: &DataSetManifest) -> bool {
        (self.filter)(manifest)
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExtractionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionOptions")
            .field("scan_interval", &self.scan_interval)
            .finish_non_exhaustive()
    }
}
