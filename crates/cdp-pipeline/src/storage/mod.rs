//! Storage gateway for data set objects
//!
//! The worker talks to object storage through the [`ObjectStore`] trait so
//! that the scan/wait/move lifecycle can be exercised against an in-memory
//! double. [`S3Store`] is the production implementation, wrapping
//! `aws_sdk_s3::Client`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    types::{Delete, ObjectIdentifier, ServerSideEncryption},
    Client,
};
use tracing::{debug, info, instrument};

pub mod config;

/// Object-storage operations the extraction worker depends on.
///
/// Implementations serialize per-object; callers need no external locking.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every key under `prefix`, following pagination to exhaustion.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch an object's bytes.
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Copy an object within the bucket, carrying the source's
    /// server-side-encryption key association over to the destination.
    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()>;

    /// Delete a batch of objects in one request.
    async fn delete_objects(&self, keys: &[String]) -> Result<()>;
}

/// S3-backed [`ObjectStore`].
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing S3 store with config: {:?}", config);

        let mut s3_config_builder = if config.access_key.is_empty() {
            // No explicit credentials configured; fall back to the default
            // provider chain (env vars, profile, instance role).
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        } else {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "cdp-storage",
            );
            aws_sdk_s3::Config::builder()
                .credentials_provider(credentials)
                .region(Region::new(config.region.clone()))
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("S3 store initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        debug!("Listing objects in s3://{}/{}", self.bucket, prefix);

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        // Results come back in pages; keep requesting until the listing is
        // no longer truncated.
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .context("Failed to list S3 objects")?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response
                    .next_continuation_token()
                    .map(|t| t.to_string());
            } else {
                break;
            }
        }

        debug!(
            "Listed {} objects under s3://{}/{}",
            keys.len(),
            self.bucket,
            prefix
        );

        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to download from S3: {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!(
            "Downloaded {} bytes from s3://{}/{}",
            data.len(),
            self.bucket,
            key
        );

        Ok(data)
    }

    #[instrument(skip(self))]
    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        debug!(
            "Copying s3://{}/{} to s3://{}/{}",
            self.bucket, src_key, self.bucket, dst_key
        );

        // A plain copy drops the source's server-side-encryption settings,
        // so read them first and re-apply them on the copy request.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(src_key)
            .send()
            .await
            .context(format!("Failed to get metadata from S3: {}", src_key))?;

        let copy_source = format!("{}/{}", self.bucket, src_key);
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dst_key);

        if let Some(kms_key_id) = head.ssekms_key_id() {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }

        request.send().await.context("Failed to copy S3 object")?;

        Ok(())
    }

    #[instrument(skip(self, keys))]
    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        debug!(
            "Deleting {} objects from s3://{}",
            keys.len(),
            self.bucket
        );

        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to build object identifiers")?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .context("Failed to build delete request")?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .context("Failed to batch-delete S3 objects")?;

        Ok(())
    }
}
