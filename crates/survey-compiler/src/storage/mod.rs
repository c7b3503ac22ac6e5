//! Object storage for published artifacts
//!
//! [`ObjectStore`] is the seam the pipeline talks to; [`S3ObjectStore`] backs
//! it with any S3-compatible service (MinIO in most deployments).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::catalog::{ShardName, Year};

pub mod config;

pub use config::StorageConfig;

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub key: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<UploadResult>;

    /// Download an object into `path`, returning the byte count
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Metadata for a key, `None` when it does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Bucket reachable, listable and writable
    async fn check_access(&self) -> Result<()>;

    fn public_url(&self, key: &str) -> String;
}

/// Key layout for everything the compiler publishes
#[derive(Debug, Clone)]
pub struct ObjectKeys {
    prefix: String,
}

impl ObjectKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn join(&self, rest: String) -> String {
        if self.prefix.is_empty() {
            rest
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }

    /// `<prefix>/layers/<LABEL><YEAR>.pmtiles`
    pub fn tiles(&self, label: &str, year: Year) -> String {
        self.join(format!("layers/{}{}.pmtiles", label, year))
    }

    /// `<prefix>/layers/<LABEL><YEAR>_<REGION>.pmtiles`
    pub fn region_tiles(&self, label: &str, year: Year, region: &ShardName) -> String {
        self.join(format!("layers/{}{}_{}.pmtiles", label, year, region))
    }

    /// Prefix under which per-region archives for a label/year are stored
    pub fn region_tiles_prefix(&self, label: &str, year: Year) -> String {
        self.join(format!("layers/{}{}_", label, year))
    }

    /// `<prefix>/result/<YEAR>/<name>`
    pub fn result(&self, year: Year, name: &str) -> String {
        self.join(format!("result/{}/{}", year, name))
    }

    pub fn result_prefix(&self, year: Year) -> String {
        self.join(format!("result/{}/", year))
    }

    pub fn probe(&self) -> String {
        self.join(format!(".preflight-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: StorageConfig,
}

impl S3ObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing object store");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "survey-compiler",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Object store client initialized for bucket: {}", config.bucket);

        Self { client, config }
    }

    pub fn keys(&self) -> ObjectKeys {
        ObjectKeys::new(self.config.key_prefix.clone())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, path))]
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<UploadResult> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.config.bucket, key);

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;

        info!("Successfully uploaded to s3://{}/{}", self.config.bucket, key);

        Ok(UploadResult {
            key: key.to_string(),
            size,
            url: self.public_url(key),
        })
    }

    #[instrument(skip(self, path))]
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .context("Failed to read S3 response body")?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from s3://{}/{}", written, self.config.bucket, key);

        Ok(written)
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix);

            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.context("Failed to list S3 objects")?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|k| ObjectInfo {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete from S3: {}", key))?;

        info!("Deleted s3://{}/{}", self.config.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0),
            })),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(anyhow!("Failed to check S3 object existence for {}: {}", key, e))
                }
            }
        }
    }

    async fn check_access(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .with_context(|| format!("Bucket {} is not reachable", self.config.bucket))?;

        self.client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .max_keys(1)
            .send()
            .await
            .context("Bucket is not listable")?;

        let probe = self.keys().probe();
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&probe)
            .body(ByteStream::from_static(b"ok"))
            .send()
            .await
            .context("Bucket is not writable")?;
        self.delete(&probe).await?;

        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        self.config.public_url(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        let keys = ObjectKeys::new("pmn/");
        let year = Year::new(2025).unwrap();
        let region = ShardName::new("musi").unwrap();

        assert_eq!(keys.tiles("EXISTING", year), "pmn/layers/EXISTING2025.pmtiles");
        assert_eq!(
            keys.region_tiles("POTENSI", year, &region),
            "pmn/layers/POTENSI2025_musi.pmtiles"
        );
        assert_eq!(
            keys.result(year, "AR_25K_PETAMANGROVE_EXISTING_2025.zip"),
            "pmn/result/2025/AR_25K_PETAMANGROVE_EXISTING_2025.zip"
        );
        assert_eq!(keys.result_prefix(year), "pmn/result/2025/");
        assert!(keys.probe().starts_with("pmn/.preflight-"));
    }

    #[test]
    fn test_object_keys_without_prefix() {
        let keys = ObjectKeys::new("");
        let year = Year::new(2024).unwrap();
        assert_eq!(keys.tiles("EXISTING", year), "layers/EXISTING2024.pmtiles");
    }
}
