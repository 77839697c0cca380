//! Remote object storage for uploaded recordings.
//!
//! The destination is a single URL:
//! - `s3://bucket[/prefix]` for S3-compatible buckets, credentials from the
//!   standard `AWS_*` variables
//! - `file:///dir` or a bare path for a local directory
//! - `memory://[prefix]` for tests

use std::io::ErrorKind;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::prefix::PrefixStore;
use object_store::{ClientOptions, ObjectStore, ObjectStoreExt, PutPayload};

/// Variable naming the remote target.
pub const REMOTE_VAR: &str = "RECSYNC_REMOTE";

const DEFAULT_REMOTE: &str = "./data/recordings";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl StorageError {
    /// Whether repeating the same operation cannot succeed.
    ///
    /// Missing local files, rejected credentials and malformed keys are
    /// permanent. Network and service errors are worth retrying.
    pub fn is_permanent(&self) -> bool {
        match self {
            StorageError::InvalidTarget(_) => true,
            StorageError::Io(err) => matches!(
                err.kind(),
                ErrorKind::NotFound
                    | ErrorKind::PermissionDenied
                    | ErrorKind::IsADirectory
                    | ErrorKind::InvalidInput
            ),
            StorageError::ObjectStore(err) => matches!(
                err,
                object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    Directory(PathBuf),
    Bucket(String),
}

impl StorageTarget {
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageTarget::Memory => "memory",
            StorageTarget::Directory(_) => "file",
            StorageTarget::Bucket(_) => "s3",
        }
    }
}

/// Where uploads go, plus an optional key prefix inside that target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub target: StorageTarget,
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            target: StorageTarget::Memory,
            prefix: None,
        }
    }

    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Self {
            target: StorageTarget::Directory(root.into()),
            prefix: None,
        }
    }

    pub fn bucket(name: impl Into<String>) -> Self {
        Self {
            target: StorageTarget::Bucket(name.into()),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.prefix = clean_prefix(prefix.as_ref());
        self
    }

    /// Parse `memory://`, `file://`, `s3://` or a bare directory path.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StorageError::InvalidTarget("empty target".into()));
        }

        let Some((scheme, rest)) = url.split_once("://") else {
            return Ok(Self::directory(url));
        };
        match scheme {
            "memory" | "mem" => Ok(Self::memory().with_prefix(rest)),
            "file" => {
                if rest.is_empty() {
                    return Err(StorageError::InvalidTarget(format!("{url}: missing directory")));
                }
                Ok(Self::directory(rest))
            }
            "s3" => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(StorageError::InvalidTarget(format!("{url}: missing bucket")));
                }
                Ok(Self::bucket(bucket).with_prefix(prefix))
            }
            other => Err(StorageError::InvalidTarget(format!(
                "unsupported scheme {other}:// (expected s3, file or memory)"
            ))),
        }
    }

    /// Read [`REMOTE_VAR`], defaulting to `./data/recordings`.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StorageError> {
        match lookup(REMOTE_VAR).filter(|v| !v.trim().is_empty()) {
            Some(url) => Self::parse(&url),
            None => Ok(Self::directory(DEFAULT_REMOTE)),
        }
    }
}

/// An object written by [`Storage::put_bytes`] or [`Storage::put_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object path within the target, prefix included.
    pub path: String,
    /// `<scheme>://<target>/<path>`, stable for a given key.
    pub location: String,
    pub size: u64,
    pub e_tag: Option<String>,
}

#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Storage {
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let base: Arc<dyn ObjectStore> = match &config.target {
            StorageTarget::Memory => Arc::new(InMemory::new()),
            StorageTarget::Directory(root) => {
                tokio::fs::create_dir_all(root).await?;
                let root = tokio::fs::canonicalize(root).await?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            StorageTarget::Bucket(bucket) => {
                let s3 = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_client_options(ClientOptions::new().with_connect_timeout(CONNECT_TIMEOUT))
                    .build()?;
                Arc::new(s3)
            }
        };

        let store: Arc<dyn ObjectStore> = match &config.prefix {
            Some(prefix) => Arc::new(PrefixStore::new(base, prefix.as_str())),
            None => base,
        };

        tracing::info!(
            scheme = config.target.scheme(),
            prefix = ?config.prefix,
            "object storage ready"
        );
        Ok(Self { config, store })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn scheme(&self) -> &'static str {
        self.config.target.scheme()
    }

    fn key_path(key: &str) -> Result<Path, StorageError> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidTarget("object key must not be empty".into()));
        }
        Ok(Path::parse(key).map_err(object_store::Error::from)?)
    }

    fn describe(&self, path: &Path, size: u64, e_tag: Option<String>) -> StoredObject {
        let full = match &self.config.prefix {
            Some(prefix) => format!("{prefix}/{path}"),
            None => path.to_string(),
        };
        let location = match &self.config.target {
            StorageTarget::Memory => format!("memory://{full}"),
            StorageTarget::Directory(root) => format!("file://{}/{full}", root.display()),
            StorageTarget::Bucket(bucket) => format!("s3://{bucket}/{full}"),
        };
        StoredObject {
            path: full,
            location,
            size,
            e_tag,
        }
    }

    /// Write `bytes` under `key`, replacing any existing object.
    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<StoredObject, StorageError> {
        let path = Self::key_path(key)?;
        let size = bytes.len() as u64;
        let result = self.store.put(&path, PutPayload::from(bytes)).await?;
        Ok(self.describe(&path, size, result.e_tag))
    }

    /// Read the local file at `source` and write it under `key`.
    pub async fn put_file(&self, key: &str, source: &FsPath) -> Result<StoredObject, StorageError> {
        let contents = tokio::fs::read(source).await?;
        tracing::debug!(key, source = %source.display(), size = contents.len(), "uploading file");
        self.put_bytes(key, Bytes::from(contents)).await
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = Self::key_path(key)?;
        Ok(self.store.get(&path).await?.bytes().await?)
    }

    /// Metadata for `key`, or `None` if nothing is stored there.
    pub async fn head(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        let path = Self::key_path(key)?;
        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(self.describe(&path, meta.size, meta.e_tag))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn clean_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim().trim_matches('/');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
