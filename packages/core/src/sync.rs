//! Owner-facing sync state and the notification payload that drives it.

use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobStatus};

/// Sync state of the owner record (the recording) a job uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Unsynced,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Unsynced => "unsynced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl From<JobStatus> for SyncStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending | JobStatus::Cancelled => SyncStatus::Unsynced,
            JobStatus::Processing => SyncStatus::Syncing,
            JobStatus::Succeeded => SyncStatus::Synced,
            JobStatus::Failed => SyncStatus::Failed,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a single `on_job_update` notification.
///
/// Delivering the same update twice must leave the owner record unchanged,
/// so it carries absolute values only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobUpdate {
    /// Snapshot the notification-relevant fields of a job.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            external_reference: job.external_reference.clone(),
            error: match job.status {
                JobStatus::Failed => job.last_error.clone(),
                _ => None,
            },
        }
    }

    /// The owner sync state this update implies.
    pub fn sync_status(&self) -> SyncStatus {
        self.status.into()
    }
}
