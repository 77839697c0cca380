//! Aggregate job counts.

use serde::{Deserialize, Serialize};

use crate::JobStatus;

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    /// Record `count` jobs in `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    /// Jobs that still need work (pending + processing).
    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }

    /// Jobs in a terminal state.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    pub fn total(&self) -> u64 {
        self.active() + self.finished()
    }

    /// Success rate over finished jobs as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.finished();
        if total == 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }
}
