//! SurrealDB-backed job store for the upload queue.
//!
//! This crate provides the database connection and the [`JobStore`], the
//! single source of truth for job state.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage
//! - `test-util`: [`JobStore::set_offline`] for simulating store outages

mod connection;
mod schema;
pub mod repositories;

use sync_core::{JobId, JobStatus};
use thiserror::Error;

pub use connection::{Database, DbConfig, connect};
pub use repositories::{ABANDONED_ERROR, JobFilter, JobStore};
pub use schema::init_schema;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The store could not be reached or rejected the query.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} kept changing underneath the update")]
    Conflict(JobId),
    /// The job was reclaimed after the caller's claim went stale.
    #[error("claim on job {id} (attempt {attempt}) is no longer current")]
    ClaimLost { id: JobId, attempt: u32 },
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Whether the error means the store itself is unreachable, as opposed
    /// to a problem with one job.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DbError::StorageUnavailable(_) | DbError::Query(_))
    }
}
