//! Core domain types for the recording upload queue.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and its transition table
//! - Owner sync state and the notification payload
//! - The retry policy and queue configuration
//! - Events for real-time updates

mod config;
mod events;
mod job;
mod retry;
mod stats;
mod sync;

pub use config::{ConfigError, SyncConfig};
pub use events::JobEvent;
pub use job::{Claim, Job, JobId, JobStatus, JobView, ParseStatusError};
pub use retry::{ErrorClass, RetryConfig, RetryDecision, RetryPolicy};
pub use stats::JobCounts;
pub use sync::{JobUpdate, SyncStatus};
