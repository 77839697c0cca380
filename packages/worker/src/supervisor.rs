//! Supervisor actor owning the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};

use crate::messages::{SupervisorMessage, WorkerMessage, WorkerStatus};
use crate::worker_actor::{WorkerActor, WorkerArgs, WorkerContext};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub workers: u32,
    pub ctx: Arc<WorkerContext>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    ctx: Arc<WorkerContext>,
    /// Worker id by actor id, so failures can be respawned under the same id.
    workers: HashMap<ActorId, (String, ActorRef<WorkerMessage>)>,
    shutting_down: bool,
}

impl SupervisorState {
    async fn spawn_worker(
        &mut self,
        myself: &ActorRef<SupervisorMessage>,
        worker_id: String,
    ) -> Result<(), ActorProcessingErr> {
        let args = WorkerArgs {
            worker_id: worker_id.clone(),
            ctx: self.ctx.clone(),
        };
        let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

        self.workers.insert(worker.get_id(), (worker_id, worker));
        Ok(())
    }
}

/// Supervisor actor that starts the workers and restarts the ones that fail.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(workers = args.workers, "starting upload supervisor");

        let mut state = SupervisorState {
            ctx: args.ctx,
            workers: HashMap::new(),
            shutting_down: false,
        };
        for n in 1..=args.workers.max(1) {
            state.spawn_worker(&myself, format!("worker-{n}")).await?;
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Wake => {
                for (_, worker) in state.workers.values() {
                    let _ = worker.send_message(WorkerMessage::Wake);
                }
            }

            SupervisorMessage::Statuses { reply } => {
                let mut statuses = Vec::with_capacity(state.workers.len());
                for (worker_id, worker) in state.workers.values() {
                    let result = ractor::rpc::call(
                        worker,
                        |reply| WorkerMessage::Status { reply },
                        Some(STATUS_TIMEOUT),
                    )
                    .await;
                    match result {
                        Ok(ractor::rpc::CallResult::Success(status)) => statuses.push(status),
                        _ => statuses.push(WorkerStatus {
                            worker_id: worker_id.clone(),
                            ..WorkerStatus::default()
                        }),
                    }
                }
                statuses.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
                let _ = reply.send(statuses);
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("shutting down upload supervisor");
                state.shutting_down = true;
                for (_, worker) in state.workers.values() {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                }
                if state.workers.is_empty() {
                    myself.stop(None);
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, reason) => {
                let Some((worker_id, _)) = state.workers.remove(&cell.get_id()) else {
                    return Ok(());
                };
                tracing::warn!(worker_id = %worker_id, reason = %reason, "worker failed");
                if !state.shutting_down {
                    state.spawn_worker(&myself, worker_id).await?;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some((worker_id, _)) = state.workers.remove(&cell.get_id()) {
                    tracing::debug!(worker_id = %worker_id, reason = ?reason, "worker stopped");
                }
            }
            _ => {}
        }

        if state.shutting_down && state.workers.is_empty() {
            myself.stop(None);
        }
        Ok(())
    }
}
