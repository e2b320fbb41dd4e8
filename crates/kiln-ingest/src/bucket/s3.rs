use super::{BlobBackend, BlobKey, Result, StorageError};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use tracing::{debug, info, instrument};

/// Bucket backed by an S3-compatible object store
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Static keys when configured, otherwise the ambient AWS credential chain
    /// (environment, profile, instance metadata).
    pub async fn new(config: &S3Config) -> Result<Self> {
        let region = Region::new(config.region.clone());

        let mut builder = if config.access_key.is_empty() {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        } else {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "kiln-bucket",
            );
            aws_sdk_s3::Config::builder()
                .credentials_provider(credentials)
                .region(region)
        }
        .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "S3 bucket client initialized");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    async fn fetch(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(StorageError::Backend(format!("get {key}: {e}")));
            },
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read body of {key}: {e}")))?
            .into_bytes()
            .to_vec();

        Ok(Some(data))
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    #[instrument(skip(self, bytes), fields(key = %key))]
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()> {
        debug!(size = bytes.len(), bucket = %self.bucket, "Uploading object");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type("application/gzip")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put {key}: {e}")))?;
        Ok(())
    }

    /// S3 objects are immutable, so appending rewrites the whole object.
    async fn append(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<()> {
        let mut combined = self.fetch(key).await?.unwrap_or_default();
        combined.extend_from_slice(&bytes);
        self.put(key, combined).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        self.fetch(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(StorageError::Backend(format!("head {key}: {e}"))),
        }
    }

    fn locate(&self, key: &BlobKey) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
