//! Upload client that writes recordings to object storage.

use std::sync::Arc;

use storage::{Storage, StorageError};
use sync_core::{Job, JobId};
use tokio_util::sync::CancellationToken;

use crate::uploader::{UploadClient, UploadError, UploadFuture};

const KEY_ROOT: &str = "recordings";

/// Puts each job's file at `recordings/<job id>/<file name>`.
///
/// The key depends only on the job, so a repeated upload overwrites the
/// earlier object instead of creating a duplicate.
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    storage: Arc<Storage>,
}

impl ObjectStoreUploader {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn object_key(job: &Job) -> String {
        let file_name = job
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());
        key_for(job.id, &file_name)
    }
}

fn key_for(id: JobId, file_name: &str) -> String {
    format!("{KEY_ROOT}/{id}/{file_name}")
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        if err.is_permanent() {
            UploadError::Permanent(err.to_string())
        } else {
            UploadError::Transient(err.to_string())
        }
    }
}

impl UploadClient for ObjectStoreUploader {
    fn upload(&self, job: &Job, cancel: CancellationToken) -> UploadFuture {
        let storage = self.storage.clone();
        let key = Self::object_key(job);
        let source = job.file_path.clone();

        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                stored = storage.put_file(&key, &source) => Ok(stored?.location),
            }
        })
    }
}
