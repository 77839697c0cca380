//! The upload collaborator seam.

use std::future::Future;
use std::pin::Pin;

use sync_core::{ErrorClass, Job};
use tokio_util::sync::CancellationToken;

/// Why an upload attempt did not produce a remote reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Timeouts, rate limits, flaky networks.
    #[error("transient upload error: {0}")]
    Transient(String),
    /// Bad credentials, rejected payloads, missing files.
    #[error("permanent upload error: {0}")]
    Permanent(String),
    /// The cancel token was observed before the upload finished.
    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    pub fn transient(msg: impl Into<String>) -> Self {
        UploadError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        UploadError::Permanent(msg.into())
    }

    /// Retry class of the error. A cancelled upload is never retried.
    pub fn class(&self) -> ErrorClass {
        match self {
            UploadError::Transient(_) => ErrorClass::Transient,
            UploadError::Permanent(_) | UploadError::Cancelled => ErrorClass::Permanent,
        }
    }
}

/// Result of an upload: the remote-side reference on success.
pub type UploadResult = Result<String, UploadError>;

/// Future type for async uploads.
pub type UploadFuture = Pin<Box<dyn Future<Output = UploadResult> + Send>>;

/// Performs the remote upload for one job.
///
/// The same job may be handed over more than once (retries, reclaims after
/// a crash), so implementations should let the remote side deduplicate,
/// typically by deriving the remote key from the job id. Implementations
/// that can stop early should watch `cancel` and return
/// [`UploadError::Cancelled`].
pub trait UploadClient: Send + Sync + 'static {
    fn upload(&self, job: &Job, cancel: CancellationToken) -> UploadFuture;
}

/// A closure-based upload client.
pub struct FnUploader<F>
where
    F: Fn(&Job, CancellationToken) -> UploadFuture + Send + Sync + 'static,
{
    upload: F,
}

impl<F> FnUploader<F>
where
    F: Fn(&Job, CancellationToken) -> UploadFuture + Send + Sync + 'static,
{
    pub fn new(upload: F) -> Self {
        Self { upload }
    }
}

impl<F> UploadClient for FnUploader<F>
where
    F: Fn(&Job, CancellationToken) -> UploadFuture + Send + Sync + 'static,
{
    fn upload(&self, job: &Job, cancel: CancellationToken) -> UploadFuture {
        (self.upload)(job, cancel)
    }
}
