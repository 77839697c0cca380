//! Owner-facing status notifications.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sync_core::{JobId, JobStatus, JobUpdate, SyncStatus};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("owner record for job {0} not found")]
    UnknownOwner(JobId),
    #[error("notification failed: {0}")]
    Failed(String),
}

/// Future type for async notifications.
pub type NotifyFuture = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send>>;

/// Receives job state changes on behalf of the record that owns the job.
///
/// Calls are at-least-once: the same update may arrive twice, and must leave
/// the owner exactly as a single delivery would.
pub trait StatusNotifier: Send + Sync + 'static {
    fn on_job_update(&self, update: JobUpdate) -> NotifyFuture;
}

/// Drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn on_job_update(&self, _update: JobUpdate) -> NotifyFuture {
        Box::pin(async { Ok(()) })
    }
}

/// A closure-based notifier.
pub struct FnNotifier<F>
where
    F: Fn(JobUpdate) -> NotifyFuture + Send + Sync + 'static,
{
    notify: F,
}

impl<F> FnNotifier<F>
where
    F: Fn(JobUpdate) -> NotifyFuture + Send + Sync + 'static,
{
    pub fn new(notify: F) -> Self {
        Self { notify }
    }
}

impl<F> StatusNotifier for FnNotifier<F>
where
    F: Fn(JobUpdate) -> NotifyFuture + Send + Sync + 'static,
{
    fn on_job_update(&self, update: JobUpdate) -> NotifyFuture {
        (self.notify)(update)
    }
}

/// Sync state of a recording as its owner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub job_id: JobId,
    pub job_status: JobStatus,
    pub sync_status: SyncStatus,
    pub external_reference: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory owner records keyed by job id.
///
/// Updates overwrite with absolute values, so repeated deliveries are
/// harmless. Once a record reflects a terminal job state, updates carrying
/// any other state are ignored.
#[derive(Debug, Clone, Default)]
pub struct OwnerSyncTable {
    records: Arc<RwLock<HashMap<JobId, OwnerRecord>>>,
}

impl OwnerSyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: JobId) -> Option<OwnerRecord> {
        self.records.read().await.get(&job_id).cloned()
    }

    pub async fn sync_status(&self, job_id: JobId) -> Option<SyncStatus> {
        self.get(job_id).await.map(|r| r.sync_status)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Apply one update. Returns whether the stored record changed.
    pub async fn apply(&self, update: JobUpdate) -> bool {
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&update.job_id) {
            let unchanged = existing.job_status == update.status
                && existing.external_reference == update.external_reference
                && existing.last_error == update.error;
            if unchanged {
                return false;
            }
            if existing.job_status.is_terminal() {
                tracing::debug!(
                    job_id = %update.job_id,
                    current = %existing.job_status,
                    incoming = %update.status,
                    "ignoring update for settled owner record"
                );
                return false;
            }
        }

        let record = OwnerRecord {
            job_id: update.job_id,
            job_status: update.status,
            sync_status: update.sync_status(),
            external_reference: update.external_reference,
            last_error: update.error,
            updated_at: Utc::now(),
        };
        records.insert(record.job_id, record);
        true
    }
}

impl StatusNotifier for OwnerSyncTable {
    fn on_job_update(&self, update: JobUpdate) -> NotifyFuture {
        let table = self.clone();
        Box::pin(async move {
            table.apply(update).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(job_id: JobId, status: JobStatus) -> JobUpdate {
        JobUpdate {
            job_id,
            status,
            external_reference: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn repeated_update_leaves_record_unchanged() {
        let table = OwnerSyncTable::new();
        let id = JobId::new();
        let done = JobUpdate {
            external_reference: Some("memory://recordings/1/a.wav".into()),
            ..update(id, JobStatus::Succeeded)
        };

        assert!(table.apply(done.clone()).await);
        let first = table.get(id).await.unwrap();

        table.on_job_update(done).await.unwrap();
        let second = table.get(id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.sync_status, SyncStatus::Synced);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn late_update_cannot_revive_a_settled_record() {
        let table = OwnerSyncTable::new();
        let id = JobId::new();

        table.apply(update(id, JobStatus::Processing)).await;
        table.apply(update(id, JobStatus::Cancelled)).await;
        assert!(!table.apply(update(id, JobStatus::Processing)).await);

        let record = table.get(id).await.unwrap();
        assert_eq!(record.job_status, JobStatus::Cancelled);
        assert_eq!(record.sync_status, SyncStatus::Unsynced);
    }

    #[tokio::test]
    async fn failure_carries_the_error() {
        let table = OwnerSyncTable::new();
        let id = JobId::new();
        let failed = JobUpdate {
            error: Some("unauthorized".into()),
            ..update(id, JobStatus::Failed)
        };

        table.apply(update(id, JobStatus::Processing)).await;
        assert_eq!(table.sync_status(id).await, Some(SyncStatus::Syncing));
        table.apply(failed).await;

        let record = table.get(id).await.unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("unauthorized"));
    }

    #[tokio::test]
    async fn fn_notifier_errors_surface_to_the_caller() {
        let notifier = FnNotifier::new(|update: JobUpdate| {
            Box::pin(async move { Err(NotifyError::UnknownOwner(update.job_id)) })
        });
        let result = notifier
            .on_job_update(update(JobId::new(), JobStatus::Succeeded))
            .await;
        assert!(matches!(result, Err(NotifyError::UnknownOwner(_))));
        assert!(NoopNotifier.on_job_update(update(JobId::new(), JobStatus::Failed)).await.is_ok());
    }
}
