use std::time::Duration;

use db::{DbConfig, DbError, JobStore};

pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Open a store backed by a fresh in-memory datastore.
pub async fn setup_store() -> Result<JobStore, DbError> {
    JobStore::open(&DbConfig::memory(), LIVENESS_TIMEOUT).await
}
