#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;

use common::{ScriptedUploader, Step};
use sync_core::{JobEvent, JobStatus, SyncStatus};
use sync_worker::{OwnerSyncTable, ServiceError, SyncQueue, SyncService, UploadError};

const LIVENESS: Duration = Duration::from_secs(60);

#[tokio::test]
async fn transient_failures_are_retried_until_success() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([
        Step::Fail(UploadError::transient("connection reset")),
        Step::Fail(UploadError::transient("503 from remote")),
        Step::Succeed,
    ]);
    let owners = OwnerSyncTable::new();
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &common::fast_config())
            .await?;

    let job = service.queue().enqueue_with_attempts("a.wav", "Take A", 3).await?;
    let done = common::wait_for_status(&store, job.id, JobStatus::Succeeded).await?;

    assert_eq!(done.attempts, 3);
    assert_eq!(
        done.external_reference.as_deref(),
        Some(common::reference_for(job.id).as_str())
    );
    assert_eq!(uploader.calls(), 3);

    let owner = common::wait_for_owner(&owners, job.id, SyncStatus::Synced).await?;
    assert_eq!(owner.external_reference, done.external_reference);

    let statuses = service.worker_statuses().await?;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].jobs_succeeded, 1);
    assert_eq!(statuses[0].jobs_claimed, 3);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn permanent_failure_fails_after_one_attempt() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([Step::Fail(UploadError::permanent("401 unauthorized"))]);
    let owners = OwnerSyncTable::new();
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &common::fast_config())
            .await?;

    let job = service.queue().enqueue_with_attempts("b.wav", "Take B", 3).await?;
    let failed = common::wait_for_status(&store, job.id, JobStatus::Failed).await?;

    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.as_deref().is_some_and(|e| e.contains("401")));

    let owner = common::wait_for_owner(&owners, job.id, SyncStatus::Failed).await?;
    assert_eq!(owner.last_error, failed.last_error);

    // No retry is ever scheduled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(uploader.calls(), 1);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn job_cancelled_before_claim_is_never_uploaded() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let owners = OwnerSyncTable::new();
    let producer = SyncQueue::new(store.clone()).with_notifier(owners.clone());

    let job = producer.enqueue("c.wav", "Take C").await?;
    let cancelled = producer.cancel(job.id).await?;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(owners.sync_status(job.id).await, Some(SyncStatus::Unsynced));

    let uploader = ScriptedUploader::default();
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &common::fast_config())
            .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(uploader.calls(), 0);
    assert_eq!(store.get(job.id).await?.status, JobStatus::Cancelled);
    assert_eq!(store.get(job.id).await?.attempts, 0);

    let view = producer.get_status(job.id).await?;
    assert_eq!(view.status, JobStatus::Cancelled);
    let cancelled = producer.list_jobs(Some(JobStatus::Cancelled)).await?;
    assert_eq!(cancelled.len(), 1);
    assert!(producer.list_jobs(Some(JobStatus::Pending)).await?.is_empty());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_during_upload_trips_the_token() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([Step::WaitForCancel]);
    let owners = OwnerSyncTable::new();
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &common::fast_config())
            .await?;

    let job = service.queue().enqueue("d.wav", "Take D").await?;
    tokio::time::timeout(common::WAIT, uploader.started()).await?;

    let flagged = service.queue().cancel(job.id).await?;
    assert!(flagged.cancel_requested);

    let cancelled = common::wait_for_status(&store, job.id, JobStatus::Cancelled).await?;
    assert_eq!(cancelled.attempts, 1);
    common::wait_for_owner(&owners, job.id, SyncStatus::Unsynced).await?;

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn crashed_claim_is_recovered_after_liveness_timeout() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(Duration::from_millis(200)).await?;
    let job = store.enqueue("e.wav", "Take E", 3).await?;

    // A worker that claimed the job and then died.
    let orphan = store.claim_next().await?.ok_or("expected a claim")?;
    assert_eq!(orphan.attempts, 1);

    let uploader = ScriptedUploader::default();
    let owners = OwnerSyncTable::new();
    let config = common::fast_config().with_upload_timeout(Duration::from_millis(100));
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &config).await?;

    let done = common::wait_for_status(&store, job.id, JobStatus::Succeeded).await?;
    assert_eq!(done.attempts, 2);
    assert_eq!(uploader.calls(), 1);
    common::wait_for_owner(&owners, job.id, SyncStatus::Synced).await?;

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stalled_upload_times_out_as_transient() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([Step::Stall]);
    let service = SyncService::start(
        store.clone(),
        uploader.clone(),
        OwnerSyncTable::new(),
        &common::fast_config(),
    )
    .await?;

    let job = service.queue().enqueue_with_attempts("f.wav", "Take F", 2).await?;
    let done = common::wait_for_status(&store, job.id, JobStatus::Succeeded).await?;

    assert_eq!(done.attempts, 2);
    assert!(done.last_error.as_deref().is_some_and(|e| e.contains("timed out")));

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn panicking_uploader_does_not_stop_the_worker() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([Step::Panic]);
    let service = SyncService::start(
        store.clone(),
        uploader.clone(),
        OwnerSyncTable::new(),
        &common::fast_config(),
    )
    .await?;

    let first = service.queue().enqueue_with_attempts("g.wav", "Take G", 1).await?;
    let failed = common::wait_for_status(&store, first.id, JobStatus::Failed).await?;
    assert!(failed.last_error.as_deref().is_some_and(|e| e.contains("panicked")));

    let second = service.queue().enqueue("h.wav", "Take H").await?;
    common::wait_for_status(&store, second.id, JobStatus::Succeeded).await?;

    service.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_uploads_each_job_once() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::default();
    let config = common::fast_config().with_workers(4);
    let service =
        SyncService::start(store.clone(), uploader.clone(), OwnerSyncTable::new(), &config).await?;

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(service.queue().enqueue(format!("{i}.wav"), format!("Take {i}")).await?.id);
    }
    for id in &ids {
        common::wait_for_status(&store, *id, JobStatus::Succeeded).await?;
    }

    let uploaded = uploader.uploaded();
    let unique: HashSet<_> = uploaded.iter().collect();
    assert_eq!(uploaded.len(), 20);
    assert_eq!(unique.len(), 20);

    let counts = service.queue().counts().await?;
    assert_eq!(counts.succeeded, 20);

    let statuses = service.worker_statuses().await?;
    assert_eq!(statuses.len(), 4);
    assert_eq!(statuses.iter().map(|s| s.jobs_succeeded).sum::<u64>(), 20);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn events_follow_the_job_lifecycle() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader =
        ScriptedUploader::new([Step::Fail(UploadError::transient("timeout")), Step::Succeed]);
    let service = SyncService::start(
        store.clone(),
        uploader,
        OwnerSyncTable::new(),
        &common::fast_config(),
    )
    .await?;
    let mut events = service.subscribe();

    let job = service.queue().enqueue("i.wav", "Take I").await?;

    let mut seen = Vec::new();
    tokio::time::timeout(common::WAIT, async {
        while let Ok(event) = events.recv().await {
            if event.job_id() != Some(job.id) {
                continue;
            }
            let done = matches!(event, JobEvent::JobSucceeded { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await?;

    let kinds: Vec<_> = seen
        .iter()
        .map(|e| match e {
            JobEvent::JobEnqueued { .. } => "enqueued",
            JobEvent::JobClaimed { .. } => "claimed",
            JobEvent::JobFailed { will_retry: true, .. } => "retrying",
            JobEvent::JobFailed { .. } => "failed",
            JobEvent::JobSucceeded { .. } => "succeeded",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["enqueued", "claimed", "retrying", "claimed", "succeeded"]
    );

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn upload_timeout_must_undercut_the_store_liveness_timeout() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(Duration::from_millis(500)).await?;
    let config = common::fast_config().with_upload_timeout(Duration::from_secs(1));

    let result =
        SyncService::start(store, ScriptedUploader::default(), OwnerSyncTable::new(), &config)
            .await;
    assert!(matches!(result, Err(ServiceError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn outcome_is_recorded_once_the_store_comes_back() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let uploader = ScriptedUploader::new([Step::SucceedThenOffline(store.clone())]);
    let owners = OwnerSyncTable::new();
    let config = common::fast_config().with_max_storage_backoff(Duration::from_millis(50));
    let service =
        SyncService::start(store.clone(), uploader.clone(), owners.clone(), &config).await?;
    let mut events = service.subscribe();

    let job = service.queue().enqueue_with_attempts("j.wav", "Take J", 1).await?;
    tokio::time::timeout(common::WAIT, async {
        while let Ok(event) = events.recv().await {
            if matches!(event, JobEvent::StorageUnavailable { .. }) {
                break;
            }
        }
    })
    .await?;

    // Several backoff rounds pass with the store down.
    tokio::time::sleep(Duration::from_millis(150)).await;
    store.set_offline(false);

    let done = common::wait_for_status(&store, job.id, JobStatus::Succeeded).await?;
    assert_eq!(done.attempts, 1);
    assert_eq!(
        done.external_reference.as_deref(),
        Some(common::reference_for(job.id).as_str())
    );
    assert_eq!(uploader.calls(), 1);
    common::wait_for_owner(&owners, job.id, SyncStatus::Synced).await?;

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn store_outage_is_not_charged_to_waiting_jobs() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store(LIVENESS).await?;
    let job = store.enqueue("k.wav", "Take K", 2).await?;
    store.set_offline(true);

    let uploader = ScriptedUploader::default();
    let config = common::fast_config().with_max_storage_backoff(Duration::from_millis(50));
    let service =
        SyncService::start(store.clone(), uploader.clone(), OwnerSyncTable::new(), &config)
            .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(uploader.calls(), 0);
    store.set_offline(false);

    let done = common::wait_for_status(&store, job.id, JobStatus::Succeeded).await?;
    assert_eq!(done.attempts, 1);
    assert_eq!(uploader.calls(), 1);

    service.shutdown().await?;
    Ok(())
}
