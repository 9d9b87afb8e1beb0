//! The worker process.
//!
//! A worker is stateless between tasks: it finds the leader, asks for work,
//! executes against the shared artifact store, and reports back. It is not
//! part of the replication group and can appear or vanish at any time; the
//! master's monitor scans absorb the churn.

pub mod map;
pub mod reduce;

use crate::artifact::ArtifactStore;
use crate::checkpoint::CHECKPOINT_EVERY;
use crate::config::{worker_identity, WorkerConfig};
use crate::error::Result;
use crate::job::{MapFn, ReduceFn};
use crate::rpc::client::{ClusterClient, MasterClient};
use crate::rpc::types::{RpcResponse, TaskAssignment};
use crate::state::TaskKind;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before re-polling after NoTask.
pub const NO_TASK_DELAY: Duration = Duration::from_secs(2);
/// Delay before re-polling when no leader is reachable.
pub const NO_LEADER_DELAY: Duration = Duration::from_secs(5);

/// Attempts to report one completion before giving up and letting the
/// timeout monitor reclaim the task.
const REPORT_ATTEMPTS: usize = 5;

pub struct Worker {
    id: String,
    config: WorkerConfig,
    cluster: ClusterClient,
    store: ArtifactStore,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
}

impl Worker {
    pub fn new(config: WorkerConfig, map_fn: MapFn, reduce_fn: ReduceFn) -> Self {
        let cluster = ClusterClient::new(&config.rpc_addresses);
        let store = ArtifactStore::new(&config.tmp_path, &config.output_path);
        Self {
            id: worker_identity(),
            config,
            cluster,
            store,
            map_fn,
            reduce_fn,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main loop: poll for work until the master says Exit.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.id, "worker starting");
        self.store.ensure_dirs().await?;
        self.spawn_heartbeat();

        loop {
            let Some(leader) = self.cluster.find_leader().await else {
                debug!(worker = %self.id, "no leader reachable");
                tokio::time::sleep(NO_LEADER_DELAY).await;
                continue;
            };
            match leader.assign_task(&self.id).await {
                Ok(RpcResponse::Ok { value }) => match value {
                    TaskAssignment::Exit => {
                        info!(worker = %self.id, "job done, exiting");
                        return Ok(());
                    }
                    TaskAssignment::NoTask => tokio::time::sleep(NO_TASK_DELAY).await,
                    assignment => self.execute(&leader, assignment).await,
                },
                Ok(RpcResponse::NotLeader { .. }) | Ok(RpcResponse::Retry { .. }) => {
                    tokio::time::sleep(NO_TASK_DELAY).await;
                }
                Ok(RpcResponse::Fatal { reason }) => {
                    warn!(worker = %self.id, reason, "assignment refused");
                    tokio::time::sleep(NO_TASK_DELAY).await;
                }
                Err(err) => {
                    debug!(worker = %self.id, %err, "assignment request failed");
                    tokio::time::sleep(NO_LEADER_DELAY).await;
                }
            }
        }
    }

    async fn execute(&self, leader: &MasterClient, assignment: TaskAssignment) {
        let (kind, task_id, result) = match assignment {
            TaskAssignment::Map {
                id,
                input,
                n_reduce,
            } => {
                info!(worker = %self.id, id, input, "running map task");
                let result =
                    map::run_map_task(&self.store, self.map_fn, id, &input, n_reduce).await;
                (TaskKind::Map, id, result)
            }
            TaskAssignment::Reduce {
                id,
                n_map,
                checkpoint,
            } => {
                info!(worker = %self.id, id, resuming = checkpoint.is_some(), "running reduce task");
                let result = reduce::run_reduce_task(
                    &self.store,
                    self.reduce_fn,
                    id,
                    n_map,
                    checkpoint.as_deref(),
                    CHECKPOINT_EVERY,
                )
                .await;
                (TaskKind::Reduce, id, result)
            }
            TaskAssignment::NoTask | TaskAssignment::Exit => return,
        };

        match result {
            Ok(()) => self.report_completion(leader, kind, task_id).await,
            Err(err) => {
                // Abandon: the timeout monitor will hand the task to someone
                // else (or back to us) later.
                warn!(worker = %self.id, %kind, task_id, %err, "task execution failed");
            }
        }
    }

    /// Report a completion, chasing the leader if it moved mid-task.
    async fn report_completion(&self, leader: &MasterClient, kind: TaskKind, task_id: u32) {
        let mut target = leader.clone();
        for attempt in 1..=REPORT_ATTEMPTS {
            match target.task_completed(task_id, kind, &self.id).await {
                Ok(RpcResponse::Ok { .. }) => {
                    debug!(worker = %self.id, %kind, task_id, "completion acknowledged");
                    return;
                }
                Ok(RpcResponse::Fatal { reason }) => {
                    // Validation rejected the artifacts; re-running is the
                    // only fix and the dispatcher owns that.
                    warn!(worker = %self.id, %kind, task_id, reason, "completion rejected");
                    return;
                }
                Ok(RpcResponse::NotLeader { .. }) | Ok(RpcResponse::Retry { .. }) | Err(_) => {
                    debug!(worker = %self.id, %kind, task_id, attempt, "completion not accepted yet");
                    tokio::time::sleep(NO_TASK_DELAY).await;
                    if let Some(new_leader) = self.cluster.find_leader().await {
                        target = new_leader;
                    }
                }
            }
        }
        warn!(worker = %self.id, %kind, task_id, "giving up on reporting completion");
    }

    /// Heartbeats run for the life of the process; failures are harmless
    /// because any task interaction also refreshes the worker record.
    fn spawn_heartbeat(&self) {
        let cluster = self.cluster.clone();
        let worker_id = self.id.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(leader) = cluster.find_leader().await {
                    if let Err(err) = leader.heartbeat(&worker_id).await {
                        debug!(worker = %worker_id, %err, "heartbeat failed");
                    }
                }
            }
        });
    }
}
