//! Durable job store with atomic state transitions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{Claim, Job, JobCounts, JobId, JobStatus};
use tokio::sync::Mutex;

use super::record::JobRecord;
use crate::{Database, DbConfig, DbError, connect, init_schema};

/// How many times a transition re-reads the row after losing a
/// compare-and-swap before giving up with [`DbError::Conflict`].
const MAX_CAS_ROUNDS: usize = 8;

/// Error text recorded on jobs that exceeded the liveness timeout with no
/// attempts left.
pub const ABANDONED_ERROR: &str = "abandoned after liveness timeout";

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    /// Only jobs in `status`.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Single source of truth for job state.
///
/// Every mutation is a compare-and-swap against the row as it was read, so
/// a stale caller can never overwrite a newer state. Mutations issued
/// through one handle (and its clones) are additionally serialized.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    write_gate: Arc<Mutex<()>>,
    liveness_timeout: Duration,
    #[cfg(feature = "test-util")]
    offline: Arc<std::sync::atomic::AtomicBool>,
}

impl JobStore {
    /// Connect, initialize the schema and return a store handle.
    pub async fn open(config: &DbConfig, liveness_timeout: Duration) -> Result<Self, DbError> {
        let db = connect(config).await?;
        Self::with_database(db, liveness_timeout).await
    }

    /// Wrap an existing connection.
    pub async fn with_database(db: Database, liveness_timeout: Duration) -> Result<Self, DbError> {
        init_schema(&db).await?;
        Ok(Self {
            db,
            write_gate: Arc::new(Mutex::new(())),
            liveness_timeout,
            #[cfg(feature = "test-util")]
            offline: Arc::default(),
        })
    }

    /// Make every operation on this store (and its clones) fail as if the
    /// datastore were unreachable, until switched back.
    #[cfg(feature = "test-util")]
    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(feature = "test-util")]
    fn ensure_online(&self) -> Result<(), DbError> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DbError::Query("job store offline".into()));
        }
        Ok(())
    }

    #[cfg(not(feature = "test-util"))]
    fn ensure_online(&self) -> Result<(), DbError> {
        Ok(())
    }

    /// Maximum time a job may stay `processing` before it is reclaimed.
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Create a new pending job.
    pub async fn enqueue(
        &self,
        file_path: impl Into<PathBuf>,
        title: impl Into<String>,
        max_attempts: u32,
    ) -> Result<Job, DbError> {
        if max_attempts == 0 {
            return Err(DbError::Invalid("max_attempts must be at least 1".into()));
        }
        self.ensure_online()?;

        let job = Job::new(file_path, title, max_attempts);
        let record: Option<JobRecord> = self
            .db
            .create(("job", job.id.to_string()))
            .content(JobRecord::from(&job))
            .await?;

        let job = record
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
            .and_then(Job::try_from)?;

        tracing::debug!(job_id = %job.id, path = %job.file_path.display(), "job enqueued");
        Ok(job)
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.ensure_online()?;
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;

        record.ok_or(DbError::NotFound(id)).and_then(Job::try_from)
    }

    /// List jobs oldest first with optional filtering.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        self.ensure_online()?;
        let mut query = String::from("SELECT * FROM job");
        if filter.status.is_some() {
            query.push_str(" WHERE status = $status");
        }
        query.push_str(" ORDER BY created_at ASC, job_id ASC");
        if filter.limit.is_some() {
            query.push_str(" LIMIT $limit");
        }
        if filter.offset.is_some() {
            query.push_str(" START $offset");
        }

        let mut request = self.db.query(query);
        if let Some(status) = filter.status {
            request = request.bind(("status", status));
        }
        if let Some(limit) = filter.limit {
            request = request.bind(("limit", limit as i64));
        }
        if let Some(offset) = filter.offset {
            request = request.bind(("offset", offset as i64));
        }

        let mut response = request.await?;
        let records: Vec<JobRecord> = response.take(0)?;

        records.into_iter().map(Job::try_from).collect()
    }

    /// Count jobs by status.
    pub async fn counts(&self) -> Result<JobCounts, DbError> {
        #[derive(Deserialize)]
        struct StatusCount {
            status: JobStatus,
            count: i64,
        }
        self.ensure_online()?;

        let mut response = self
            .db
            .query("SELECT status, count() AS count FROM job GROUP BY status")
            .await?;
        let rows: Vec<StatusCount> = response.take(0)?;

        let mut counts = JobCounts::default();
        for row in rows {
            counts.add(row.status, row.count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Claim the oldest eligible job, moving it to `processing`.
    pub async fn claim_next(&self) -> Result<Option<Job>, DbError> {
        self.claim_next_at(Utc::now()).await
    }

    /// [`claim_next`](Self::claim_next) evaluated at `now`.
    ///
    /// Eligible jobs are `pending` ones whose retry time has elapsed and
    /// that have no cancel request, plus `processing` ones whose claim is
    /// older than the liveness timeout. Either way the claim increments
    /// `attempts`, and jobs without attempts left are never claimed.
    pub async fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>, DbError> {
        let _gate = self.write_gate.lock().await;
        self.ensure_online()?;
        let now_us = now.timestamp_micros();
        let stale_before = self.stale_before(now_us);

        for _ in 0..MAX_CAS_ROUNDS {
            let mut response = self
                .db
                .query(CLAIM_CANDIDATE)
                .bind(("now", now_us))
                .bind(("stale_before", stale_before))
                .await?;
            let records: Vec<JobRecord> = response.take(0)?;
            let Some(current) = records.into_iter().next().map(Job::try_from).transpose()? else {
                return Ok(None);
            };

            ensure_transition(&current, JobStatus::Processing)?;
            let reclaim = current.status == JobStatus::Processing;

            let mut next = current.clone();
            next.status = JobStatus::Processing;
            next.attempts += 1;
            next.claimed_at = Some(now);
            next.updated_at = now;

            if let Some(claimed) = self.compare_and_swap(&current, &next).await? {
                if reclaim {
                    tracing::warn!(
                        job_id = %claimed.id,
                        attempts = claimed.attempts,
                        "reclaimed job that exceeded the liveness timeout"
                    );
                } else {
                    tracing::debug!(
                        job_id = %claimed.id,
                        attempts = claimed.attempts,
                        "job claimed"
                    );
                }
                return Ok(Some(claimed));
            }
        }

        Ok(None)
    }

    /// `processing -> succeeded` under `claim`. No-op if the job is
    /// already terminal; [`DbError::ClaimLost`] if it was reclaimed since.
    pub async fn mark_succeeded(
        &self,
        claim: &Claim,
        external_reference: impl Into<String>,
    ) -> Result<Job, DbError> {
        let external_reference = external_reference.into();
        self.transition(claim.job_id, |job, now| match job.status {
            status if status.is_terminal() => Ok(None),
            _ if !claim.holds(job) => Err(claim_lost(claim)),
            JobStatus::Processing => {
                let mut next = job.clone();
                next.status = JobStatus::Succeeded;
                next.external_reference = Some(external_reference.clone());
                next.updated_at = now;
                Ok(Some(next))
            }
            _ => Err(illegal(job, JobStatus::Succeeded)),
        })
        .await
    }

    /// Record a failed attempt.
    ///
    /// A retryable failure with attempts left returns the job to `pending`,
    /// claimable again after `retry_delay`; anything else is terminal
    /// `failed`. A job with a pending cancel request is cancelled instead of
    /// being retried. No-op if the job is already terminal;
    /// [`DbError::ClaimLost`] if it was reclaimed since `claim`.
    pub async fn mark_failed(
        &self,
        claim: &Claim,
        error: impl Into<String>,
        retryable: bool,
        retry_delay: Duration,
    ) -> Result<Job, DbError> {
        let error = error.into();
        let delay = chrono::Duration::from_std(retry_delay).unwrap_or(chrono::Duration::MAX);

        self.transition(claim.job_id, |job, now| match job.status {
            status if status.is_terminal() => Ok(None),
            _ if !claim.holds(job) => Err(claim_lost(claim)),
            JobStatus::Processing => {
                let mut next = job.clone();
                next.last_error = Some(error.clone());
                next.updated_at = now;
                if !(retryable && job.has_attempts_left()) {
                    next.status = JobStatus::Failed;
                } else if job.cancel_requested {
                    next.status = JobStatus::Cancelled;
                } else {
                    next.status = JobStatus::Pending;
                    next.available_at = now.checked_add_signed(delay).unwrap_or(now);
                }
                Ok(Some(next))
            }
            _ => Err(illegal(job, JobStatus::Failed)),
        })
        .await
    }

    /// `pending | processing -> cancelled`. No-op if already terminal.
    ///
    /// With a `claim`, only a job still held under that claim is cancelled.
    /// Without one, the job is cancelled whoever holds it.
    pub async fn mark_cancelled(&self, id: JobId, claim: Option<&Claim>) -> Result<Job, DbError> {
        self.transition(id, |job, now| {
            if job.status.is_terminal() {
                return Ok(None);
            }
            if let Some(claim) = claim
                && !claim.holds(job)
            {
                return Err(claim_lost(claim));
            }
            match job.status {
                JobStatus::Pending | JobStatus::Processing => {
                    let mut next = job.clone();
                    next.status = JobStatus::Cancelled;
                    next.cancel_requested = true;
                    next.updated_at = now;
                    Ok(Some(next))
                }
                _ => Err(illegal(job, JobStatus::Cancelled)),
            }
        })
        .await
    }

    /// Set `cancel_requested`.
    ///
    /// A pending job is cancelled on the spot. A processing job keeps its
    /// status until a worker checkpoint observes the flag. Terminal jobs
    /// cannot be cancelled.
    pub async fn request_cancel(&self, id: JobId) -> Result<Job, DbError> {
        self.transition(id, |job, now| match job.status {
            JobStatus::Pending => {
                let mut next = job.clone();
                next.status = JobStatus::Cancelled;
                next.cancel_requested = true;
                next.updated_at = now;
                Ok(Some(next))
            }
            JobStatus::Processing if job.cancel_requested => Ok(None),
            JobStatus::Processing => {
                let mut next = job.clone();
                next.cancel_requested = true;
                next.updated_at = now;
                Ok(Some(next))
            }
            _ => Err(illegal(job, JobStatus::Cancelled)),
        })
        .await
    }

    /// Fail jobs stuck in `processing` past the liveness timeout that have
    /// no attempts left to be reclaimed with. Jobs with a cancel request
    /// end `cancelled` instead.
    pub async fn expire_abandoned(&self) -> Result<Vec<Job>, DbError> {
        self.expire_abandoned_at(Utc::now()).await
    }

    /// [`expire_abandoned`](Self::expire_abandoned) evaluated at `now`.
    pub async fn expire_abandoned_at(&self, now: DateTime<Utc>) -> Result<Vec<Job>, DbError> {
        let _gate = self.write_gate.lock().await;
        self.ensure_online()?;
        let stale_before = self.stale_before(now.timestamp_micros());

        let mut response = self
            .db
            .query(ABANDONED_JOBS)
            .bind(("stale_before", stale_before))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        let mut expired = Vec::new();
        for record in records {
            let current = Job::try_from(record)?;
            // A cancel request outranks the abandonment, as in `mark_failed`.
            let outcome = if current.cancel_requested {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            };
            ensure_transition(&current, outcome)?;

            let mut next = current.clone();
            next.status = outcome;
            next.last_error = Some(ABANDONED_ERROR.to_string());
            next.updated_at = now;

            if let Some(failed) = self.compare_and_swap(&current, &next).await? {
                tracing::warn!(
                    job_id = %failed.id,
                    attempts = failed.attempts,
                    status = %failed.status,
                    "job abandoned"
                );
                expired.push(failed);
            }
        }

        Ok(expired)
    }

    fn stale_before(&self, now_us: i64) -> i64 {
        let timeout_us = i64::try_from(self.liveness_timeout.as_micros()).unwrap_or(i64::MAX);
        now_us.saturating_sub(timeout_us)
    }

    /// Read-modify-write loop shared by the `mark_*` operations.
    ///
    /// `step` returns `None` to leave the job untouched.
    async fn transition<F>(&self, id: JobId, step: F) -> Result<Job, DbError>
    where
        F: Fn(&Job, DateTime<Utc>) -> Result<Option<Job>, DbError>,
    {
        let _gate = self.write_gate.lock().await;

        for _ in 0..MAX_CAS_ROUNDS {
            let current = self.get(id).await?;
            let now = Utc::now();
            let Some(next) = step(&current, now)? else {
                return Ok(current);
            };
            ensure_transition(&current, next.status)?;

            if let Some(saved) = self.compare_and_swap(&current, &next).await? {
                tracing::debug!(
                    job_id = %id,
                    from = %current.status,
                    to = %saved.status,
                    "job transition"
                );
                return Ok(saved);
            }
        }

        Err(DbError::Conflict(id))
    }

    /// Write `next` only if the row still matches `current`.
    async fn compare_and_swap(&self, current: &Job, next: &Job) -> Result<Option<Job>, DbError> {
        let expected = JobRecord::from(current);
        let wanted = JobRecord::from(next);

        let params = CasParams {
            id: wanted.job_id,
            status: wanted.status,
            attempts: wanted.attempts,
            updated_at: wanted.updated_at,
            available_at: wanted.available_at,
            claimed_at: wanted.claimed_at,
            last_error: wanted.last_error,
            external_reference: wanted.external_reference,
            cancel_requested: wanted.cancel_requested,
            expected_status: expected.status,
            expected_attempts: expected.attempts,
            expected_claimed_at: expected.claimed_at,
            expected_cancel_requested: expected.cancel_requested,
        };

        let mut response = self.db.query(CAS_UPDATE).bind(params).await?;
        let records: Vec<JobRecord> = response.take(0)?;

        records.into_iter().next().map(Job::try_from).transpose()
    }
}

/// Bindings for [`CAS_UPDATE`].
#[derive(Serialize)]
struct CasParams {
    id: String,
    status: JobStatus,
    attempts: u32,
    updated_at: i64,
    available_at: i64,
    claimed_at: i64,
    last_error: Option<String>,
    external_reference: Option<String>,
    cancel_requested: bool,
    expected_status: JobStatus,
    expected_attempts: u32,
    expected_claimed_at: i64,
    expected_cancel_requested: bool,
}

fn illegal(job: &Job, to: JobStatus) -> DbError {
    DbError::IllegalTransition {
        id: job.id,
        from: job.status,
        to,
    }
}

fn claim_lost(claim: &Claim) -> DbError {
    DbError::ClaimLost {
        id: claim.job_id,
        attempt: claim.attempt,
    }
}

fn ensure_transition(job: &Job, to: JobStatus) -> Result<(), DbError> {
    if job.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(illegal(job, to))
    }
}

const CLAIM_CANDIDATE: &str = r#"
SELECT * FROM job
WHERE attempts < max_attempts
    AND (
        (status = "pending" AND cancel_requested = false AND available_at <= $now)
        OR (status = "processing" AND claimed_at <= $stale_before)
    )
ORDER BY created_at ASC, job_id ASC
LIMIT 1
"#;

const ABANDONED_JOBS: &str = r#"
SELECT * FROM job
WHERE status = "processing"
    AND claimed_at <= $stale_before
    AND attempts >= max_attempts
ORDER BY created_at ASC, job_id ASC
"#;

const CAS_UPDATE: &str = r#"
UPDATE type::thing("job", $id) SET
    status = $status,
    attempts = $attempts,
    updated_at = $updated_at,
    available_at = $available_at,
    claimed_at = $claimed_at,
    last_error = $last_error,
    external_reference = $external_reference,
    cancel_requested = $cancel_requested
WHERE status = $expected_status
    AND attempts = $expected_attempts
    AND claimed_at = $expected_claimed_at
    AND cancel_requested = $expected_cancel_requested
RETURN AFTER
"#;
