//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobId};

/// Events emitted by the upload queue for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A new job was enqueued.
    JobEnqueued { job: Job, timestamp: DateTime<Utc> },
    /// A worker claimed a job and is about to upload it.
    JobClaimed {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// The upload finished and the remote reference was recorded.
    JobSucceeded {
        job_id: JobId,
        external_reference: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An attempt failed.
    JobFailed {
        job_id: JobId,
        error: String,
        attempts: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A producer asked for the job to be cancelled.
    CancelRequested {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// The job reached `cancelled`.
    JobCancelled {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A job exceeded the liveness timeout with no attempts left.
    JobAbandoned {
        job_id: JobId,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker started polling.
    WorkerStarted {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped.
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The job store could not be reached; the worker is backing off.
    StorageUnavailable {
        worker_id: String,
        error: String,
        retry_in_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobClaimed { timestamp, .. } => *timestamp,
            JobEvent::JobSucceeded { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::CancelRequested { timestamp, .. } => *timestamp,
            JobEvent::JobCancelled { timestamp, .. } => *timestamp,
            JobEvent::JobAbandoned { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
            JobEvent::StorageUnavailable { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobEnqueued { job, .. } => Some(job.id),
            JobEvent::JobClaimed { job_id, .. }
            | JobEvent::JobSucceeded { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::CancelRequested { job_id, .. }
            | JobEvent::JobCancelled { job_id, .. }
            | JobEvent::JobAbandoned { job_id, .. } => Some(*job_id),
            JobEvent::WorkerStarted { .. }
            | JobEvent::WorkerStopped { .. }
            | JobEvent::StorageUnavailable { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job, .. } => {
                format!("Job {} enqueued for {}", job.id, job.file_path.display())
            }
            JobEvent::JobClaimed {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} claimed by {} (attempt {})", job_id, worker_id, attempt),
            JobEvent::JobSucceeded {
                job_id,
                external_reference,
                duration_ms,
                ..
            } => format!(
                "Job {} uploaded as {} in {}ms",
                job_id, external_reference, duration_ms
            ),
            JobEvent::JobFailed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            JobEvent::CancelRequested { job_id, .. } => {
                format!("Job {} cancellation requested", job_id)
            }
            JobEvent::JobCancelled { job_id, .. } => format!("Job {} cancelled", job_id),
            JobEvent::JobAbandoned {
                job_id, attempts, ..
            } => format!("Job {} abandoned after {} attempts", job_id, attempts),
            JobEvent::WorkerStarted { worker_id, .. } => format!("Worker {} started", worker_id),
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
            JobEvent::StorageUnavailable {
                worker_id,
                error,
                retry_in_ms,
                ..
            } => format!(
                "Worker {} cannot reach job store ({}), retrying in {}ms",
                worker_id, error, retry_in_ms
            ),
        }
    }
}
