//! Cancel tokens for in-flight uploads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sync_core::JobId;
use tokio_util::sync::CancellationToken;

/// Maps each job being uploaded to the token its upload observes.
///
/// The persisted `cancel_requested` flag is authoritative; tokens only let a
/// running upload stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<JobId, Entry>>>,
    generation: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh token for `job_id`. The entry is removed when the
    /// guard drops.
    pub fn register(&self, job_id: JobId) -> CancelGuard {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.tokens().insert(
            job_id,
            Entry {
                generation,
                token: token.clone(),
            },
        );
        CancelGuard {
            registry: self.clone(),
            job_id,
            generation,
            token,
        }
    }

    /// Trip the token of an in-flight upload. Returns false if `job_id` is
    /// not being uploaded.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.tokens().get(&job_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, job_id: JobId) -> bool {
        self.tokens().contains_key(&job_id)
    }

    pub fn in_flight(&self) -> usize {
        self.tokens().len()
    }
}

/// Keeps a job's token registered for the duration of one upload.
#[derive(Debug)]
pub struct CancelGuard {
    registry: CancelRegistry,
    job_id: JobId,
    generation: u64,
    token: CancellationToken,
}

impl CancelGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut tokens = self.registry.tokens();
        // A reclaimed job may have registered a newer token under the same id.
        if tokens
            .get(&self.job_id)
            .is_some_and(|e| e.generation == self.generation)
        {
            tokens.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_trips_the_registered_token() {
        let registry = CancelRegistry::new();
        let id = JobId::new();
        let guard = registry.register(id);

        assert!(registry.is_in_flight(id));
        assert!(registry.cancel(id));
        assert!(guard.is_cancelled());
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn stale_guard_keeps_the_newer_registration() {
        let registry = CancelRegistry::new();
        let id = JobId::new();
        let old = registry.register(id);
        let new = registry.register(id);

        drop(old);
        assert!(registry.is_in_flight(id));
        assert!(registry.cancel(id));
        assert!(new.is_cancelled());
    }

    #[test]
    fn guard_drop_unregisters() {
        let registry = CancelRegistry::new();
        let id = JobId::new();
        drop(registry.register(id));

        assert_eq!(registry.in_flight(), 0);
        assert!(!registry.cancel(id));
    }
}
