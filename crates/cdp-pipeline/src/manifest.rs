//! Data set manifest model
//!
//! Each data set uploaded to the bucket carries a `manifest.xml` describing
//! the batch: its timestamp (the batch identity), a sequence number, and the
//! record files that make up the batch. Pending data sets live under the
//! `Incoming/` prefix and are relocated to `Done/` once processed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// The key prefix that pending/incoming data sets are pulled from.
pub const PENDING_PREFIX: &str = "Incoming";

/// The key prefix that completed data sets are moved to.
pub const COMPLETED_PREFIX: &str = "Done";

/// The file name of the manifest object within a data set.
pub const MANIFEST_FILE_NAME: &str = "manifest.xml";

/// Errors produced while reading a manifest body.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("duplicate entry name in manifest: '{0}'")]
    DuplicateEntry(String),
}

/// The closed set of record file categories a manifest entry can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordFileType {
    Beneficiary,
    Carrier,
    Dme,
    Hha,
    Hospice,
    Inpatient,
    Outpatient,
    Pde,
    Snf,
}

impl std::str::FromStr for RecordFileType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BENEFICIARY" => Ok(RecordFileType::Beneficiary),
            "CARRIER" => Ok(RecordFileType::Carrier),
            "DME" => Ok(RecordFileType::Dme),
            "HHA" => Ok(RecordFileType::Hha),
            "HOSPICE" => Ok(RecordFileType::Hospice),
            "INPATIENT" => Ok(RecordFileType::Inpatient),
            "OUTPATIENT" => Ok(RecordFileType::Outpatient),
            "PDE" => Ok(RecordFileType::Pde),
            "SNF" => Ok(RecordFileType::Snf),
            _ => Err(anyhow::anyhow!("Invalid record file type: {}", s)),
        }
    }
}

/// A single file declared by a data set manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetManifestEntry {
    /// File name, unique within the manifest.
    #[serde(rename = "@name")]
    pub name: String,

    /// Category of records the file contains.
    #[serde(rename = "@type")]
    pub file_type: RecordFileType,
}

impl DataSetManifestEntry {
    pub fn new(name: impl Into<String>, file_type: RecordFileType) -> Self {
        Self {
            name: name.into(),
            file_type,
        }
    }
}

/// Descriptor for one data set: the batch timestamp (its identity), a
/// sequence number, and the ordered list of files in the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "dataSetManifest")]
pub struct DataSetManifest {
    /// Identifies the data set; two manifests with the same timestamp are
    /// the same batch.
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "@sequenceId")]
    pub sequence_id: u32,

    #[serde(rename = "entry", default)]
    pub entries: Vec<DataSetManifestEntry>,
}

impl DataSetManifest {
    pub fn new(
        timestamp: DateTime<Utc>,
        sequence_id: u32,
        entries: Vec<DataSetManifestEntry>,
    ) -> Self {
        Self {
            timestamp,
            sequence_id,
            entries,
        }
    }

    /// Parse a manifest from its XML body, enforcing that entry names are
    /// unique within the manifest.
    pub fn parse(xml: &str) -> Result<Self, ManifestError> {
        let manifest: DataSetManifest = quick_xml::de::from_str(xml)?;

        let mut seen = HashSet::new();
        for entry in &manifest.entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(ManifestError::DuplicateEntry(entry.name.clone()));
            }
        }

        Ok(manifest)
    }

    /// Serialize the manifest to XML, e.g. for seeding test buckets.
    pub fn to_xml(&self) -> Result<String, quick_xml::SeError> {
        quick_xml::se::to_string(self)
    }

    /// Key of this manifest's object under the pending prefix.
    pub fn pending_manifest_key(&self) -> String {
        pending_key(self.timestamp, MANIFEST_FILE_NAME)
    }

    /// Prefix all of this data set's pending objects share, with a trailing
    /// slash (`Incoming/<timestamp>/`).
    pub fn pending_prefix(&self) -> String {
        format!("{}/{}/", PENDING_PREFIX, format_instant(self.timestamp))
    }

    /// Relative names of every object in the data set: each entry plus the
    /// manifest itself.
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.name.clone()).collect();
        names.push(MANIFEST_FILE_NAME.to_string());
        names
    }
}

/// Format a timestamp the way it appears in object keys: an ISO-8601 instant
/// in UTC, fractional seconds only when non-zero.
pub fn format_instant(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse the `<id>` segment of a manifest key as an ISO-8601 instant.
pub fn parse_instant(id: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(id)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Key of a data set object under the pending prefix.
pub fn pending_key(timestamp: DateTime<Utc>, name: &str) -> String {
    format!("{}/{}/{}", PENDING_PREFIX, format_instant(timestamp), name)
}

/// Key of a data set object under the completed prefix.
pub fn completed_key(timestamp: DateTime<Utc>, name: &str) -> String {
    format!("{}/{}/{}", COMPLETED_PREFIX, format_instant(timestamp), name)
}

/// Returns the `<id>` segment if `key` matches `<prefix>/<id>/manifest.xml`.
fn manifest_id_under<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_suffix(MANIFEST_FILE_NAME)?
        .strip_suffix('/')
}

/// Returns the `<id>` segment of a pending manifest key
/// (`Incoming/<id>/manifest.xml`), or `None` if the key is something else.
pub fn pending_manifest_id(key: &str) -> Option<&str> {
    manifest_id_under(PENDING_PREFIX, key)
}

/// Returns the `<id>` segment of a completed manifest key
/// (`Done/<id>/manifest.xml`), or `None` if the key is something else.
pub fn completed_manifest_id(key: &str) -> Option<&str> {
    manifest_id_under(COMPLETED_PREFIX, key)
}
