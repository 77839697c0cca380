//! Worker actor: claims jobs and drives them to a terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use db::{DbError, JobStore};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use sync_core::{Claim, Job, JobEvent, JobStatus, JobUpdate, RetryPolicy, SyncConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cancellation::CancelRegistry;
use crate::messages::{WorkerMessage, WorkerStatus};
use crate::notifier::StatusNotifier;
use crate::uploader::{UploadClient, UploadError, UploadResult};

/// Shared by every worker of one service.
pub struct WorkerContext {
    pub(crate) store: JobStore,
    pub(crate) uploader: Arc<dyn UploadClient>,
    pub(crate) notifier: Arc<dyn StatusNotifier>,
    pub(crate) cancels: CancelRegistry,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) policy: RetryPolicy,
    pub(crate) poll_interval: Duration,
    pub(crate) upload_timeout: Duration,
    pub(crate) max_storage_backoff: Duration,
}

impl WorkerContext {
    pub fn new(
        store: JobStore,
        uploader: Arc<dyn UploadClient>,
        notifier: Arc<dyn StatusNotifier>,
        config: &SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            uploader,
            notifier,
            cancels: CancelRegistry::new(),
            events,
            policy: RetryPolicy::from(&config.retry),
            poll_interval: config.poll_interval(),
            upload_timeout: config.upload_timeout(),
            max_storage_backoff: config.max_storage_backoff(),
        }
    }

    fn broadcast(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Tell the owner about the job's current state. Failures are logged
    /// and never undo the transition.
    async fn notify(&self, job: &Job) {
        let update = JobUpdate::from_job(job);
        if let Err(e) = self.notifier.on_job_update(update).await {
            tracing::warn!(
                job_id = %job.id,
                status = %job.status,
                error = %e,
                "owner notification failed"
            );
        }
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub ctx: Arc<WorkerContext>,
}

/// How an upload attempt ended, before the store has recorded it.
enum Outcome {
    Succeeded { reference: String, elapsed: Duration },
    Cancelled,
    Failed { message: String, retry: bool, delay: Duration },
}

/// An outcome still to be written under the claim that produced it.
struct Unsettled {
    job: Job,
    claim: Claim,
    outcome: Outcome,
}

/// State for the worker actor.
pub struct WorkerState {
    worker_id: String,
    ctx: Arc<WorkerContext>,
    ticker: Option<JoinHandle<()>>,
    /// Current store backoff, doubled on each consecutive outage.
    backoff: Option<Duration>,
    resume_at: Option<Instant>,
    /// Held across store outages; no new job is claimed until it lands.
    unsettled: Option<Unsettled>,
    counters: WorkerStatus,
}

impl WorkerState {
    fn new(worker_id: String, ctx: Arc<WorkerContext>) -> Self {
        Self {
            counters: WorkerStatus {
                worker_id: worker_id.clone(),
                ..WorkerStatus::default()
            },
            worker_id,
            ctx,
            ticker: None,
            backoff: None,
            resume_at: None,
            unsettled: None,
        }
    }

    fn backing_off(&self) -> bool {
        self.resume_at.is_some_and(|at| Instant::now() < at)
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            backing_off: self.backing_off(),
            ..self.counters.clone()
        }
    }

    fn store_reachable(&mut self) {
        if self.backoff.take().is_some() {
            tracing::info!(worker_id = %self.worker_id, "job store reachable again");
        }
        self.resume_at = None;
    }

    fn store_unreachable(&mut self, err: &DbError) {
        let delay = next_backoff(
            self.backoff,
            self.ctx.poll_interval,
            self.ctx.max_storage_backoff,
        );
        self.backoff = Some(delay);
        self.resume_at = Some(Instant::now() + delay);

        let retry_in_ms = delay.as_millis() as u64;
        tracing::error!(
            worker_id = %self.worker_id,
            error = %err,
            retry_in_ms,
            "job store unavailable"
        );
        self.ctx.broadcast(JobEvent::StorageUnavailable {
            worker_id: self.worker_id.clone(),
            error: err.to_string(),
            retry_in_ms,
            timestamp: Utc::now(),
        });
    }

    /// Write the held outcome, if any. Returns false while the store is
    /// unreachable; the outcome is kept and retried after the backoff.
    async fn settle_pending(&mut self) -> bool {
        let Some(unsettled) = self.unsettled.take() else {
            return true;
        };

        match self.record(&unsettled).await {
            Ok(updated) => {
                self.store_reachable();
                self.announce(unsettled, updated).await;
                true
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    job_id = %unsettled.job.id,
                    "holding upload outcome until the job store is back"
                );
                self.store_unreachable(&e);
                self.unsettled = Some(unsettled);
                false
            }
            Err(DbError::ClaimLost { id, attempt }) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    job_id = %id,
                    attempt,
                    "job was reclaimed before its outcome was recorded; dropping it"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    job_id = %unsettled.job.id,
                    error = %e,
                    "could not record job outcome"
                );
                true
            }
        }
    }

    /// Fail processing jobs that ran out of attempts and went stale.
    /// Returns false if the store is unreachable.
    async fn expire_abandoned(&mut self) -> bool {
        let ctx = self.ctx.clone();
        match ctx.store.expire_abandoned().await {
            Ok(expired) => {
                self.store_reachable();
                for job in expired {
                    tracing::warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        "job abandoned after liveness timeout"
                    );
                    ctx.broadcast(JobEvent::JobAbandoned {
                        job_id: job.id,
                        attempts: job.attempts,
                        timestamp: Utc::now(),
                    });
                    ctx.notify(&job).await;
                }
                true
            }
            Err(e) if e.is_unavailable() => {
                self.store_unreachable(&e);
                false
            }
            Err(e) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    error = %e,
                    "expiring abandoned jobs failed"
                );
                true
            }
        }
    }

    /// Claim and process at most one job. Returns true if a job was
    /// processed, so more may be waiting.
    async fn process_next(&mut self) -> bool {
        let claimed = self.ctx.store.claim_next().await;
        match claimed {
            Ok(Some(job)) => {
                self.store_reachable();
                self.run_job(job).await;
                true
            }
            Ok(None) => {
                self.store_reachable();
                false
            }
            Err(e) if e.is_unavailable() => {
                self.store_unreachable(&e);
                false
            }
            Err(e) => {
                tracing::error!(worker_id = %self.worker_id, error = %e, "claim failed");
                false
            }
        }
    }

    async fn run_job(&mut self, job: Job) {
        let ctx = self.ctx.clone();
        let Some(claim) = job.claim() else {
            tracing::error!(job_id = %job.id, status = %job.status, "claimed job carries no claim");
            return;
        };
        self.counters.jobs_claimed += 1;

        tracing::debug!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            attempt = job.attempts,
            "claimed job"
        );
        ctx.broadcast(JobEvent::JobClaimed {
            job_id: job.id,
            worker_id: self.worker_id.clone(),
            attempt: job.attempts,
            timestamp: Utc::now(),
        });
        ctx.notify(&job).await;

        let guard = ctx.cancels.register(job.id);
        // A cancel request that landed before the token existed is only
        // visible in the store.
        let cancel_requested = match ctx.store.get(job.id).await {
            Ok(current) => current.cancel_requested,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "could not re-check cancel flag");
                job.cancel_requested
            }
        };

        let started = Instant::now();
        let result = if cancel_requested || guard.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            upload(&ctx, &job, guard.token()).await
        };
        drop(guard);

        let outcome = match result {
            Ok(reference) => Outcome::Succeeded {
                reference,
                elapsed: started.elapsed(),
            },
            Err(UploadError::Cancelled) => Outcome::Cancelled,
            Err(err) => {
                let decision = ctx.policy.decide(job.attempts, job.max_attempts, err.class());
                Outcome::Failed {
                    message: err.to_string(),
                    retry: decision.retry,
                    delay: decision.delay,
                }
            }
        };
        self.unsettled = Some(Unsettled {
            job,
            claim,
            outcome,
        });
        self.settle_pending().await;
    }

    async fn record(&self, unsettled: &Unsettled) -> Result<Job, DbError> {
        let store = &self.ctx.store;
        let claim = &unsettled.claim;
        match &unsettled.outcome {
            Outcome::Succeeded { reference, .. } => {
                store.mark_succeeded(claim, reference.as_str()).await
            }
            Outcome::Cancelled => store.mark_cancelled(claim.job_id, Some(claim)).await,
            Outcome::Failed {
                message,
                retry,
                delay,
            } => store.mark_failed(claim, message.as_str(), *retry, *delay).await,
        }
    }

    /// Events, counters and owner notification for a recorded outcome.
    async fn announce(&mut self, unsettled: Unsettled, updated: Job) {
        let ctx = self.ctx.clone();
        let job = unsettled.job;
        match unsettled.outcome {
            Outcome::Succeeded { reference, elapsed } => {
                if updated.status == JobStatus::Succeeded {
                    self.counters.jobs_succeeded += 1;
                    tracing::info!(job_id = %job.id, reference = %reference, "upload succeeded");
                    ctx.broadcast(JobEvent::JobSucceeded {
                        job_id: updated.id,
                        external_reference: updated
                            .external_reference
                            .clone()
                            .unwrap_or(reference),
                        duration_ms: elapsed.as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                }
                ctx.notify(&updated).await;
            }

            Outcome::Cancelled => {
                if updated.status == JobStatus::Cancelled {
                    self.counters.jobs_cancelled += 1;
                    tracing::info!(job_id = %job.id, "upload cancelled");
                    ctx.broadcast(JobEvent::JobCancelled {
                        job_id: job.id,
                        timestamp: Utc::now(),
                    });
                }
                ctx.notify(&updated).await;
            }

            Outcome::Failed { message, delay, .. } => {
                let will_retry = updated.status == JobStatus::Pending;
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %message,
                    will_retry,
                    retry_in_ms = delay.as_millis() as u64,
                    "upload failed"
                );
                ctx.broadcast(JobEvent::JobFailed {
                    job_id: job.id,
                    error: message,
                    attempts: updated.attempts,
                    will_retry,
                    timestamp: Utc::now(),
                });

                match updated.status {
                    // The owner stays `syncing` while a retry is pending.
                    JobStatus::Pending => {}
                    JobStatus::Failed => {
                        self.counters.jobs_failed += 1;
                        ctx.notify(&updated).await;
                    }
                    JobStatus::Cancelled => {
                        self.counters.jobs_cancelled += 1;
                        ctx.broadcast(JobEvent::JobCancelled {
                            job_id: job.id,
                            timestamp: Utc::now(),
                        });
                        ctx.notify(&updated).await;
                    }
                    _ => ctx.notify(&updated).await,
                }
            }
        }
    }
}

/// Run one upload attempt in its own task, bounded by the upload timeout.
/// Panics and timeouts count as transient failures.
async fn upload(ctx: &WorkerContext, job: &Job, token: CancellationToken) -> UploadResult {
    let uploader = ctx.uploader.clone();
    let owned = job.clone();
    let cancel = token.clone();
    let mut task = tokio::spawn(async move { uploader.upload(&owned, cancel).await });

    match tokio::time::timeout(ctx.upload_timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => Err(UploadError::transient(format!("upload panicked: {e}"))),
        Ok(Err(e)) => Err(UploadError::transient(format!("upload task failed: {e}"))),
        Err(_) => {
            token.cancel();
            task.abort();
            Err(UploadError::transient(format!(
                "upload timed out after {:?}",
                ctx.upload_timeout
            )))
        }
    }
}

/// Delay before the next store access after an outage: the poll interval
/// first, then doubling, capped at `max`.
pub(crate) fn next_backoff(
    previous: Option<Duration>,
    poll_interval: Duration,
    max: Duration,
) -> Duration {
    let next = match previous {
        None => poll_interval,
        Some(prev) => prev.saturating_mul(2),
    };
    next.min(max.max(poll_interval))
}

/// Worker actor that executes upload jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(worker_id = %args.worker_id, "starting worker");

        let mut state = WorkerState::new(args.worker_id, args.ctx);

        // Poll loop
        let period = state.ctx.poll_interval;
        let ticker = myself.clone();
        state.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ticker.send_message(WorkerMessage::Tick).is_err() {
                    break;
                }
            }
        }));

        state.ctx.broadcast(JobEvent::WorkerStarted {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Tick => {
                if state.backing_off()
                    || !state.settle_pending().await
                    || !state.expire_abandoned().await
                {
                    return Ok(());
                }
                if state.process_next().await {
                    let _ = myself.send_message(WorkerMessage::Wake);
                }
            }

            WorkerMessage::Wake => {
                if state.backing_off() || !state.settle_pending().await {
                    return Ok(());
                }
                if state.process_next().await {
                    let _ = myself.send_message(WorkerMessage::Wake);
                }
            }

            WorkerMessage::Status { reply } => {
                let _ = reply.send(state.status());
            }

            WorkerMessage::Shutdown => {
                tracing::info!(worker_id = %state.worker_id, "shutting down worker");
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        if let Some(unsettled) = state.unsettled.take() {
            tracing::warn!(
                worker_id = %state.worker_id,
                job_id = %unsettled.job.id,
                "stopped before the job store accepted the upload outcome"
            );
        }
        state.ctx.broadcast(JobEvent::WorkerStopped {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(1_000);

    #[test]
    fn store_backoff_doubles_from_the_poll_interval() {
        let first = next_backoff(None, POLL, MAX);
        let second = next_backoff(Some(first), POLL, MAX);
        let third = next_backoff(Some(second), POLL, MAX);

        assert_eq!(first, POLL);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(400));
    }

    #[test]
    fn store_backoff_is_capped() {
        assert_eq!(next_backoff(Some(Duration::from_millis(800)), POLL, MAX), MAX);
        assert_eq!(next_backoff(Some(Duration::MAX), POLL, MAX), MAX);
        // A cap below the poll interval never shortens the poll.
        assert_eq!(next_backoff(None, POLL, Duration::from_millis(10)), POLL);
    }
}
