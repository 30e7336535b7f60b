use crate::config::types::{S3Config, StoreConfig};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, ServerSideEncryption, StorageClass};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Network trouble, throttling, server errors: worth another attempt.
    #[error("{0}")]
    Retryable(String),

    /// Credentials, malformed request, missing bucket: retrying cannot help.
    #[error("{0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}

/// HTTP statuses worth retrying: 408, 429 and every 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn classify_io(context: &str, e: io::Error) -> StoreError {
    let message = format!("{}: {}", context, e);
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            StoreError::Fatal(message)
        }
        _ => StoreError::Retryable(message),
    }
}

/// Whole-object PUT. `Ok` means the store acknowledged a durable write.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// Build the configured store.
pub async fn build_store(config: &StoreConfig) -> SharedObjectStore {
    match config {
        StoreConfig::S3(s3) => Arc::new(S3Store::from_config(s3).await),
        StoreConfig::Local(local) => Arc::new(LocalDirStore::new(local.path.clone())),
    }
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Credentials come from the standard AWS provider chain.
    pub async fn from_config(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(
            bucket = %config.bucket,
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Initializing S3 object store"
        );
        Self::new(aws_sdk_s3::Client::from_conf(builder.build()), config.bucket.clone())
    }

    fn classify(err: SdkError<PutObjectError>) -> StoreError {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                StoreError::Retryable(message)
            }
            SdkError::ServiceError(service) => {
                let status = service.raw().status().as_u16();
                if is_retryable_status(status) {
                    StoreError::Retryable(format!("HTTP {}: {}", status, message))
                } else {
                    StoreError::Fatal(format!("HTTP {}: {}", status, message))
                }
            }
            SdkError::ConstructionFailure(_) => StoreError::Fatal(message),
            _ => StoreError::Retryable(message),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| classify_io(&format!("reading {}", path.display()), e))?;
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type("application/vnd.apache.parquet")
            .server_side_encryption(ServerSideEncryption::Aes256)
            .storage_class(StorageClass::Standard)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(Self::classify)?;

        debug!(bucket = %self.bucket, key, size, "PUT acknowledged");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Filesystem store for bench deployments: objects become files under `root`.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let dest = self.object_path(key);
        let tmp = crate::batch::writer::staging_name(&dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io(&format!("creating {}", parent.display()), e))?;
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| classify_io(&format!("reading {}", path.display()), e))?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| classify_io(&format!("creating {}", tmp.display()), e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| classify_io(&format!("writing {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| classify_io(&format!("syncing {}", tmp.display()), e))?;
        drop(file);

        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| classify_io(&format!("renaming {}", tmp.display()), e))?;
        debug!(dest = %dest.display(), size = bytes.len(), "Object stored");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
