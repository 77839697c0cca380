#![allow(dead_code)]

use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use db::{DbConfig, DbError, JobStore};
use sync_core::{Job, JobId, JobStatus, RetryConfig, SyncConfig, SyncStatus};
use sync_worker::{OwnerRecord, OwnerSyncTable, UploadClient, UploadError, UploadFuture};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Fast polling and near-zero retry delays.
pub fn fast_config() -> SyncConfig {
    SyncConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_upload_timeout(Duration::from_secs(1))
        .with_retry(RetryConfig {
            base_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 5,
            jitter: 0.0,
        })
}

pub async fn setup_store(liveness_timeout: Duration) -> Result<JobStore, DbError> {
    JobStore::open(&DbConfig::memory(), liveness_timeout).await
}

/// What the scripted uploader does on one call.
#[derive(Clone)]
pub enum Step {
    Succeed,
    /// Succeed, but take the job store down before reporting back.
    SucceedThenOffline(JobStore),
    Fail(UploadError),
    /// Block until the cancel token trips.
    WaitForCancel,
    /// Never finish on its own.
    Stall,
    Panic,
}

/// Upload client that replays a script, then succeeds.
#[derive(Clone, Default)]
pub struct ScriptedUploader {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<AtomicUsize>,
    uploaded: Arc<Mutex<Vec<JobId>>>,
    started: Arc<Notify>,
}

impl ScriptedUploader {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Job ids of every call, in call order.
    pub fn uploaded(&self) -> Vec<JobId> {
        self.uploaded.lock().unwrap().clone()
    }

    /// Resolves once an upload has started.
    pub async fn started(&self) {
        self.started.notified().await;
    }
}

pub fn reference_for(id: JobId) -> String {
    format!("remote/{id}")
}

impl UploadClient for ScriptedUploader {
    fn upload(&self, job: &Job, cancel: CancellationToken) -> UploadFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uploaded.lock().unwrap().push(job.id);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        let reference = reference_for(job.id);
        let started = self.started.clone();

        Box::pin(async move {
            started.notify_one();
            match step {
                Step::Succeed => Ok(reference),
                Step::SucceedThenOffline(store) => {
                    store.set_offline(true);
                    Ok(reference)
                }
                Step::Fail(err) => Err(err),
                Step::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(UploadError::Cancelled)
                }
                Step::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(reference)
                }
                Step::Panic => panic!("uploader blew up"),
            }
        })
    }
}

/// Poll the store until the job reaches `status`.
pub async fn wait_for_status(
    store: &JobStore,
    id: JobId,
    status: JobStatus,
) -> Result<Job, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = store.get(id).await?;
        if job.status == status {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("job {id} stuck in {} waiting for {status}", job.status).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the owner table until the record reaches `status`.
pub async fn wait_for_owner(
    owners: &OwnerSyncTable,
    id: JobId,
    status: SyncStatus,
) -> Result<OwnerRecord, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(record) = owners.get(id).await
            && record.sync_status == status
        {
            return Ok(record);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("owner of job {id} never reached {status}").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
