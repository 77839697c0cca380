//! Persisted shape of a job row.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{Job, JobId, JobStatus};

use crate::DbError;

/// Internal record type for SurrealDB.
///
/// Timestamps are microseconds since the epoch; `claimed_at` is 0 until the
/// first claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub job_id: String,
    pub file_path: String,
    pub title: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub available_at: i64,
    #[serde(default)]
    pub claimed_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            file_path: job.file_path.to_string_lossy().into_owned(),
            title: job.title.clone(),
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at.timestamp_micros(),
            updated_at: job.updated_at.timestamp_micros(),
            available_at: job.available_at.timestamp_micros(),
            claimed_at: job.claimed_at.map_or(0, |t| t.timestamp_micros()),
            last_error: job.last_error.clone(),
            external_reference: job.external_reference.clone(),
            cancel_requested: job.cancel_requested,
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let id = JobId::parse(&record.job_id)
            .map_err(|e| DbError::Corrupt(format!("bad job id {}: {}", record.job_id, e)))?;

        Ok(Job {
            id,
            file_path: PathBuf::from(record.file_path),
            title: record.title,
            status: record.status,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            created_at: from_micros(record.created_at)?,
            updated_at: from_micros(record.updated_at)?,
            available_at: from_micros(record.available_at)?,
            claimed_at: match record.claimed_at {
                0 => None,
                micros => Some(from_micros(micros)?),
            },
            last_error: record.last_error,
            external_reference: record.external_reference,
            cancel_requested: record.cancel_requested,
        })
    }
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| DbError::Corrupt(format!("timestamp out of range: {}", micros)))
}
