//! Actor-based upload workers for the recording sync queue.
//!
//! # Architecture
//!
//! - `Supervisor` - Spawns the workers and restarts any that fail
//! - `WorkerActor` - Polls the job store, claims one job at a time and
//!   drives it to a terminal state through an [`UploadClient`]
//! - [`SyncQueue`] - Producer API: enqueue, cancel, inspect
//! - [`StatusNotifier`] - Idempotent callback keeping the owning record's
//!   sync state current
//!
//! # Usage
//!
//! ```ignore
//! use sync_worker::{ObjectStoreUploader, OwnerSyncTable, SyncService};
//!
//! let service = SyncService::start(store, uploader, OwnerSyncTable::new(), &config).await?;
//! let job = service.queue().enqueue("takes/a.wav", "Take 1").await?;
//! ```

mod cancellation;
mod messages;
mod notifier;
mod object_uploader;
mod service;
mod supervisor;
mod uploader;
mod worker_actor;

pub use cancellation::{CancelGuard, CancelRegistry};
pub use messages::{SupervisorMessage, WorkerMessage, WorkerStatus};
pub use notifier::{
    FnNotifier, NoopNotifier, NotifyError, NotifyFuture, OwnerRecord, OwnerSyncTable,
    StatusNotifier,
};
pub use object_uploader::ObjectStoreUploader;
pub use service::{ServiceError, SyncQueue, SyncService};
pub use supervisor::{Supervisor, SupervisorArgs};
pub use uploader::{FnUploader, UploadClient, UploadError, UploadFuture, UploadResult};
pub use worker_actor::{WorkerActor, WorkerArgs, WorkerContext};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
