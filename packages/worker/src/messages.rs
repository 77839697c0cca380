//! Message types for actor communication.

use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Periodic poll: housekeeping, then try to claim a job.
    Tick,

    /// Try to claim a job now (after enqueue, or after finishing a job).
    Wake,

    /// Report counters.
    Status { reply: RpcReplyPort<WorkerStatus> },

    /// Stop after the current message.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Forward a wake-up to every worker.
    Wake,

    /// Collect every worker's status.
    Statuses { reply: RpcReplyPort<Vec<WorkerStatus>> },

    /// Stop all workers, then the supervisor.
    Shutdown,
}

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Whether the worker is holding off after the job store became unreachable.
    pub backing_off: bool,
}
