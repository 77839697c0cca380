//! Producer-facing queue API and the running worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use db::{DbError, JobFilter, JobStore};
use ractor::{Actor, ActorRef};
use sync_core::{
    ConfigError, Job, JobCounts, JobEvent, JobId, JobStatus, JobUpdate, JobView, SyncConfig,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cancellation::CancelRegistry;
use crate::messages::{SupervisorMessage, WorkerStatus};
use crate::notifier::{NoopNotifier, StatusNotifier};
use crate::supervisor::{Supervisor, SupervisorArgs};
use crate::uploader::UploadClient;
use crate::worker_actor::WorkerContext;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job store error: {0}")]
    Store(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn supervisor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("supervisor unreachable: {0}")]
    Messaging(String),
}

/// Producer API: enqueue uploads, request cancellation, inspect jobs.
///
/// Cheap to clone. A queue built with [`SyncQueue::new`] only writes to the
/// store; workers find its jobs on their next poll.
#[derive(Clone)]
pub struct SyncQueue {
    store: JobStore,
    notifier: Arc<dyn StatusNotifier>,
    cancels: CancelRegistry,
    events: broadcast::Sender<JobEvent>,
    supervisor: Option<ActorRef<SupervisorMessage>>,
    default_max_attempts: u32,
}

impl SyncQueue {
    pub fn new(store: JobStore) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            notifier: Arc::new(NoopNotifier),
            cancels: CancelRegistry::new(),
            events,
            supervisor: None,
            default_max_attempts: SyncConfig::default().default_max_attempts,
        }
    }

    fn attached(
        ctx: &WorkerContext,
        supervisor: ActorRef<SupervisorMessage>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store: ctx.store.clone(),
            notifier: ctx.notifier.clone(),
            cancels: ctx.cancels.clone(),
            events: ctx.events.clone(),
            supervisor: Some(supervisor),
            default_max_attempts: max_attempts,
        }
    }

    pub fn with_notifier(mut self, notifier: impl StatusNotifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn wake(&self) {
        if let Some(supervisor) = &self.supervisor {
            let _ = supervisor.send_message(SupervisorMessage::Wake);
        }
    }

    /// Enqueue an upload with the default attempt budget.
    pub async fn enqueue(
        &self,
        file_path: impl Into<PathBuf>,
        title: impl Into<String>,
    ) -> Result<Job, DbError> {
        self.enqueue_with_attempts(file_path, title, self.default_max_attempts)
            .await
    }

    pub async fn enqueue_with_attempts(
        &self,
        file_path: impl Into<PathBuf>,
        title: impl Into<String>,
        max_attempts: u32,
    ) -> Result<Job, DbError> {
        let job = self.store.enqueue(file_path, title, max_attempts).await?;
        let _ = self.events.send(JobEvent::JobEnqueued {
            job: job.clone(),
            timestamp: Utc::now(),
        });
        self.wake();
        Ok(job)
    }

    /// Request cancellation.
    ///
    /// A pending job is cancelled immediately. A processing job is flagged
    /// and its upload's cancel token tripped; it settles as `cancelled`
    /// unless the upload already completed.
    pub async fn cancel(&self, id: JobId) -> Result<Job, DbError> {
        let job = self.store.request_cancel(id).await?;
        let now = Utc::now();
        let _ = self.events.send(JobEvent::CancelRequested {
            job_id: id,
            timestamp: now,
        });

        if job.status == JobStatus::Cancelled {
            tracing::info!(job_id = %id, "job cancelled before upload");
            let _ = self.events.send(JobEvent::JobCancelled {
                job_id: id,
                timestamp: now,
            });
            if let Err(e) = self.notifier.on_job_update(JobUpdate::from_job(&job)).await {
                tracing::warn!(job_id = %id, error = %e, "owner notification failed");
            }
        } else if self.cancels.cancel(id) {
            tracing::debug!(job_id = %id, "tripped in-flight upload");
        }
        Ok(job)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobView, DbError> {
        self.store.get(id).await.map(JobView::from)
    }

    /// All jobs, optionally restricted to one status, oldest first.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobView>, DbError> {
        let filter = JobFilter {
            status,
            ..JobFilter::default()
        };
        let jobs = self.store.list(filter).await?;
        Ok(jobs.into_iter().map(JobView::from).collect())
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        self.store.list(filter).await
    }

    pub async fn counts(&self) -> Result<JobCounts, DbError> {
        self.store.counts().await
    }
}

/// A running worker pool plus the queue that feeds it.
pub struct SyncService {
    supervisor: ActorRef<SupervisorMessage>,
    handle: JoinHandle<()>,
    queue: SyncQueue,
}

impl SyncService {
    /// Spawn `config.workers` workers polling `store`.
    ///
    /// Fails if an upload could outlive the store's liveness timeout.
    pub async fn start(
        store: JobStore,
        uploader: impl UploadClient,
        notifier: impl StatusNotifier,
        config: &SyncConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        SyncConfig::check_timeouts(config.upload_timeout(), store.liveness_timeout())?;

        let ctx = Arc::new(WorkerContext::new(
            store,
            Arc::new(uploader),
            Arc::new(notifier),
            config,
        ));

        let args = SupervisorArgs {
            workers: config.workers,
            ctx: ctx.clone(),
        };
        let (supervisor, handle) = Actor::spawn(None, Supervisor, args).await?;

        tracing::info!(
            workers = config.workers,
            poll_interval_ms = config.poll_interval_ms,
            "upload service started"
        );
        let queue = SyncQueue::attached(&ctx, supervisor.clone(), config.default_max_attempts);
        Ok(Self {
            supervisor,
            handle,
            queue,
        })
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub async fn worker_statuses(&self) -> Result<Vec<WorkerStatus>, ServiceError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.supervisor
            .send_message(SupervisorMessage::Statuses { reply: tx.into() })
            .map_err(|e| ServiceError::Messaging(e.to_string()))?;
        rx.await
            .map_err(|_| ServiceError::Messaging("status reply dropped".into()))
    }

    /// Stop all workers once their current job settles.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        self.supervisor
            .send_message(SupervisorMessage::Shutdown)
            .map_err(|e| ServiceError::Messaging(e.to_string()))?;
        self.handle
            .await
            .map_err(|e| ServiceError::Messaging(e.to_string()))?;
        tracing::info!("upload service stopped");
        Ok(())
    }
}
