//! Job domain types for deferred uploads.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
///
/// The id doubles as the idempotency key handed to the upload collaborator,
/// so it is never regenerated across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    #[default]
    Pending,
    /// Claimed by a worker; an upload may be in flight.
    Processing,
    /// Upload finished and an external reference was recorded.
    Succeeded,
    /// Gave up: permanent error or attempts exhausted.
    Failed,
    /// Cancelled by the producer.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Processing -> Processing` is the reclaim of a job whose worker
    /// exceeded the liveness timeout. Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Pending, Pending) | (Pending, Succeeded) | (Pending, Failed) => false,
            (Processing, _) => true,
            (Succeeded, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }

    /// Get a simple status string for display and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// A job represents one recording waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier and idempotency key.
    pub id: JobId,
    /// Local file to upload.
    pub file_path: PathBuf,
    /// Human-readable title sent along with the upload.
    pub title: String,
    /// Current status.
    pub status: JobStatus,
    /// Number of attempts started so far (claims, including reclaims).
    #[serde(default)]
    pub attempts: u32,
    /// Upper bound on `attempts`.
    pub max_attempts: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed again.
    pub available_at: DateTime<Utc>,
    /// When the current (or last) claim happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Most recent failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Identifier returned by the upload collaborator on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    /// Set once by a cancel request, never cleared.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Create a new pending job.
    pub fn new(file_path: impl Into<PathBuf>, title: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            file_path: file_path.into(),
            title: title.into(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            available_at: now,
            claimed_at: None,
            last_error: None,
            external_reference: None,
            cancel_requested: false,
        }
    }

    /// Whether another attempt may still be started.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The claim a worker holds on this job, if it is `processing`.
    pub fn claim(&self) -> Option<Claim> {
        if self.status != JobStatus::Processing {
            return None;
        }
        self.claimed_at.map(|claimed_at| Claim {
            job_id: self.id,
            attempt: self.attempts,
            claimed_at,
        })
    }
}

/// One claim on a job: the attempt it started and when.
///
/// A reclaim starts a new attempt, so an outcome reported under an older
/// claim no longer matches the stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    pub attempt: u32,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    /// Whether `job` is still held under this claim.
    pub fn holds(&self, job: &Job) -> bool {
        job.id == self.job_id
            && job.attempts == self.attempt
            && job.claimed_at == Some(self.claimed_at)
    }
}

/// Read model handed to producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub file_path: PathBuf,
    pub title: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    pub cancel_requested: bool,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            file_path: job.file_path,
            title: job.title,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            last_error: job.last_error,
            external_reference: job.external_reference,
            cancel_requested: job.cancel_requested,
        }
    }
}
