use cdp_common::{CdpError, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    /// Load storage configuration from environment variables. The bucket is
    /// required; everything else has workable defaults.
    pub fn from_env() -> Result<Self> {
        let bucket = env::var("CDP_S3_BUCKET")
            .or_else(|_| env::var("S3_BUCKET"))
            .map_err(|_| CdpError::Config("CDP_S3_BUCKET is not set".to_string()))?;

        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket,
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    pub fn for_aws(region: impl Into<String>, bucket: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: None,
            region: region.into(),
            bucket: bucket.into(),
            access_key: env::var("AWS_ACCESS_KEY_ID")
                .map_err(|_| CdpError::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?,
            secret_key: env::var("AWS_SECRET_ACCESS_KEY")
                .map_err(|_| CdpError::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?,
            path_style: false,
        })
    }
}
