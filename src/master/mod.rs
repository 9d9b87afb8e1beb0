//! The replicated master.
//!
//! Every replica runs the same `Master`; at most one is leader at a time.
//! All state-machine writes flow through the replication log into a single
//! apply task. The dispatcher, monitor scans, and RPC handlers only read the
//! state or propose commands. Task start times, worker records, and the
//! reduce checkpoint map are leader-private overlays that die with
//! leadership; recovery rebuilds what matters from the artifacts on disk.

mod dispatch;
mod monitor;
mod recovery;
mod workers;

pub use workers::WorkerRegistry;

use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::raft::{self, ApplyMsg, RaftConfig, RaftHandle, Role};
use crate::rpc::types::{MasterInfo, TaskRef, WorkerInfo};
use crate::state::{Command, JobState, ReplicaAddrs, TaskKind};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{error, info, warn};

/// Ask the replication layer to compact its log this often (in applied
/// commands).
const SNAPSHOT_EVERY: u64 = 256;

/// How long a proposer waits for commit plus apply before reporting a
/// retriable failure.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Master {
    pub(crate) config: Config,
    pub(crate) store: ArtifactStore,
    pub(crate) raft: RaftHandle,
    pub(crate) state: RwLock<JobState>,
    pub(crate) workers: Mutex<WorkerRegistry>,
    /// Leader-private start times for in-progress tasks. Never replicated.
    pub(crate) start_times: Mutex<HashMap<(TaskKind, u32), Instant>>,
    /// Leader-private map of reduce task id to a recorded checkpoint path.
    pub(crate) checkpoints: Mutex<HashMap<u32, PathBuf>>,
    applied: watch::Receiver<u64>,
    /// False until post-election recovery has reconciled state with disk.
    serving: watch::Sender<bool>,
}

impl Master {
    /// Boot one replica: open the artifact store, start the replication
    /// node, and spawn the apply loop, leadership watcher, and monitor scans.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let store = ArtifactStore::new(&config.tmp_path, &config.output_path);
        store.ensure_dirs().await?;

        let mut raft_config = RaftConfig::new(
            config.my_replication_addr().to_string(),
            config.replication_addresses.clone(),
            config.data_path.clone(),
        );
        raft_config.clean_start = config.clean_start;

        let (apply_tx, apply_rx) = mpsc::channel(256);
        let raft = raft::spawn(raft_config, apply_tx).await?;

        // Every replica derives the same initial state from the same config;
        // a snapshot install overwrites it when this replica is behind.
        let inputs: Vec<String> = config
            .inputs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut initial = if inputs.is_empty() {
            JobState::empty()
        } else {
            JobState::new_job(inputs, config.worker_count)
        };
        for (i, replication) in config.replication_addresses.iter().enumerate() {
            initial.membership.insert(
                replication.clone(),
                ReplicaAddrs {
                    replication: replication.clone(),
                    rpc: config.rpc_addresses[i].clone(),
                },
            );
        }

        let (applied_tx, applied_rx) = watch::channel(0u64);
        let (serving_tx, _serving_rx) = watch::channel(false);
        let registry = WorkerRegistry::new(config.heartbeat_interval, config.worker_timeout);

        let master = Arc::new(Self {
            store,
            raft,
            state: RwLock::new(initial),
            workers: Mutex::new(registry),
            start_times: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(HashMap::new()),
            applied: applied_rx,
            serving: serving_tx,
            config,
        });

        tokio::spawn(apply_loop(master.clone(), apply_rx, applied_tx));
        tokio::spawn(leadership_loop(master.clone()));
        monitor::spawn_scans(master.clone());
        Ok(master)
    }

    /// Bind and run both HTTP listeners until one fails or the process stops.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let rpc_router = crate::rpc::router(self.clone());
        let replication_router = self.raft.replication_router();

        let rpc_listener = tokio::net::TcpListener::bind(self.config.my_rpc_addr()).await?;
        let replication_listener =
            tokio::net::TcpListener::bind(self.config.my_replication_addr()).await?;
        info!(
            rpc = self.config.my_rpc_addr(),
            replication = self.config.my_replication_addr(),
            "master replica serving"
        );

        tokio::try_join!(
            axum::serve(rpc_listener, rpc_router).into_future(),
            axum::serve(replication_listener, replication_router).into_future(),
        )?;
        Ok(())
    }

    // ---- leader gating ----

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub(crate) fn is_serving_leader(&self) -> bool {
        self.raft.is_leader() && *self.serving.borrow()
    }

    pub(crate) async fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader(self.leader_rpc_hint().await))
        }
    }

    /// Leader check plus the recovery gate: AssignTask and TaskCompleted
    /// must not run until reconciliation finished.
    pub(crate) async fn ensure_serving_leader(&self) -> Result<()> {
        self.ensure_leader().await?;
        if !*self.serving.borrow() {
            return Err(Error::Unavailable("leader is reconciling state".into()));
        }
        Ok(())
    }

    /// RPC address of the best-known leader, for redirect hints.
    pub async fn leader_rpc_hint(&self) -> Option<String> {
        let hint = self.raft.status().leader_hint?;
        if let Some(rpc) = self.config.rpc_addr_for(&hint) {
            return Some(rpc.to_string());
        }
        let state = self.state.read().await;
        state.membership.get(&hint).map(|r| r.rpc.clone())
    }

    // ---- proposals ----

    /// Propose a command and wait until it is committed and applied here.
    /// On failure the state machine is untouched and the call is retriable.
    pub(crate) async fn commit(&self, cmd: Command) -> Result<u64> {
        let index = tokio::time::timeout(COMMIT_TIMEOUT, self.raft.propose(&cmd))
            .await
            .map_err(|_| Error::Replication("proposal timed out".into()))??;
        let mut applied = self.applied.clone();
        tokio::time::timeout(COMMIT_TIMEOUT, applied.wait_for(|a| *a >= index))
            .await
            .map_err(|_| Error::Replication("timed out waiting for apply".into()))?
            .map_err(|_| Error::Replication("apply loop stopped".into()))?;
        Ok(index)
    }

    // ---- worker RPC operations (assign_task lives in dispatch.rs) ----

    /// TaskCompleted: validate the claimed artifacts before anything commits.
    pub async fn task_completed(
        &self,
        kind: TaskKind,
        task_id: u32,
        worker_id: &str,
    ) -> Result<()> {
        self.ensure_serving_leader().await?;

        let (n_reduce, in_range) = {
            let state = self.state.read().await;
            let in_range = match kind {
                TaskKind::Map => task_id < state.n_map(),
                TaskKind::Reduce => task_id < state.n_reduce,
            };
            (state.n_reduce, in_range)
        };
        if !in_range {
            return Err(Error::Validation(format!("unknown {kind} task {task_id}")));
        }

        let artifacts_valid = match kind {
            TaskKind::Map => self.store.map_artifacts_valid(task_id, n_reduce),
            TaskKind::Reduce => self.store.reduce_artifact_valid(task_id),
        };
        if !artifacts_valid {
            warn!(%kind, task_id, worker = worker_id, "completion rejected: artifacts invalid");
            return Err(Error::Validation(format!(
                "{kind} task {task_id} artifacts failed validation"
            )));
        }

        let cmd = match kind {
            TaskKind::Map => Command::CompleteMap { id: task_id },
            TaskKind::Reduce => Command::CompleteReduce { id: task_id },
        };
        self.commit(cmd).await?;
        self.workers
            .lock()
            .await
            .record_completion(worker_id, kind, task_id);
        info!(%kind, task_id, worker = worker_id, "task completion recorded");
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.ensure_leader().await?;
        self.workers.lock().await.observe(worker_id);
        Ok(())
    }

    /// Manual reset. A `checkpoint=<path>` reason records the checkpoint for
    /// the task before the reset applies, so the next assignee resumes.
    pub async fn reset_task(&self, task_id: u32, kind: TaskKind, reason: &str) -> Result<()> {
        self.ensure_leader().await?;
        if let Some(path) = reason.strip_prefix("checkpoint=") {
            if kind == TaskKind::Reduce && !path.is_empty() {
                self.checkpoints
                    .lock()
                    .await
                    .insert(task_id, PathBuf::from(path));
            }
        }
        info!(%kind, task_id, reason, "manual task reset");
        self.commit(Command::ResetTask {
            id: task_id,
            kind,
            invalidate: false,
        })
        .await?;
        self.workers.lock().await.release_task(kind, task_id);
        Ok(())
    }

    pub async fn transfer_leadership(&self) -> Result<()> {
        self.raft.transfer_leadership().await
    }

    // ---- membership ----

    /// Add a replica to the group. The new process should already be up and
    /// listening: once the command applies, the quorum includes it.
    pub async fn add_master(&self, replication_addr: String, rpc_addr: String) -> Result<()> {
        self.ensure_leader().await?;
        info!(replica = %replication_addr, "adding master to membership");
        self.commit(Command::AddMaster {
            replication_addr,
            rpc_addr,
        })
        .await?;
        Ok(())
    }

    /// Remove a replica from the group. The command must commit under the
    /// old quorum before the shrink takes effect.
    pub async fn remove_master(&self, replication_addr: String) -> Result<()> {
        self.ensure_leader().await?;
        info!(replica = %replication_addr, "removing master from membership");
        self.commit(Command::RemoveMaster { replication_addr }).await?;
        Ok(())
    }

    /// Current cluster membership, from this replica's view of the state.
    pub async fn membership(&self) -> Vec<ReplicaAddrs> {
        let state = self.state.read().await;
        state.membership.values().cloned().collect()
    }

    // ---- introspection ----

    pub async fn master_info(&self) -> MasterInfo {
        let status = self.raft.status();
        MasterInfo {
            my_id: self.config.my_id,
            is_leader: status.role == Role::Leader,
            leader_addr: self.leader_rpc_hint().await,
            raft_state: status.role,
            term: status.term,
            last_seen: status.last_leader_contact,
        }
    }

    pub async fn worker_infos(&self) -> Vec<WorkerInfo> {
        self.workers.lock().await.snapshot()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn worker_tasks(&self, worker_id: &str) -> Vec<TaskRef> {
        self.workers.lock().await.tasks_of(worker_id)
    }

    /// A copy of the replicated state, for tests and debugging.
    pub async fn job_state(&self) -> JobState {
        self.state.read().await.clone()
    }

    /// Stop participating: close the serving gate and halt the replication
    /// node. Pending proposals fail retriably.
    pub async fn shutdown(&self) {
        self.serving.send_replace(false);
        self.raft.shutdown().await;
    }

    /// Block until this replica leads and has finished recovery, or the
    /// deadline passes. Boot scripts and tests use this to know when the
    /// replica will accept assignments.
    pub async fn wait_until_serving(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_serving_leader() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

/// The single writer of the task state machine. Consumes committed commands
/// and snapshots in log order, keeps leader-private overlays tidy, and
/// periodically hands the replication layer a compaction image.
async fn apply_loop(
    master: Arc<Master>,
    mut apply_rx: mpsc::Receiver<ApplyMsg>,
    applied_tx: watch::Sender<u64>,
) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command } => {
                let cmd: Command = match serde_json::from_value(command) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        warn!(index, %err, "skipping undecodable command");
                        applied_tx.send_replace(index);
                        continue;
                    }
                };

                {
                    let mut state = master.state.write().await;
                    state.apply(&cmd);
                }

                match &cmd {
                    Command::CompleteMap { id } => {
                        master.start_times.lock().await.remove(&(TaskKind::Map, *id));
                        master.workers.lock().await.release_task(TaskKind::Map, *id);
                    }
                    Command::CompleteReduce { id } => {
                        master
                            .start_times
                            .lock()
                            .await
                            .remove(&(TaskKind::Reduce, *id));
                        master.workers.lock().await.release_task(TaskKind::Reduce, *id);
                        // The worker deleted its checkpoint on commit.
                        master.checkpoints.lock().await.remove(id);
                    }
                    Command::ResetTask { id, kind, .. } => {
                        master.start_times.lock().await.remove(&(*kind, *id));
                        master.workers.lock().await.release_task(*kind, *id);
                    }
                    Command::AddMaster { .. } | Command::RemoveMaster { .. } => {
                        let peers: Vec<String> = {
                            let state = master.state.read().await;
                            state.membership.keys().cloned().collect()
                        };
                        // Detached send: the node might itself be blocked
                        // handing us the next committed entry.
                        let raft = master.raft.clone();
                        tokio::spawn(async move { raft.set_peers(peers).await });
                    }
                }

                applied_tx.send_replace(index);

                if index % SNAPSHOT_EVERY == 0 {
                    let data = {
                        let state = master.state.read().await;
                        serde_json::to_value(&*state)
                    };
                    match data {
                        Ok(data) => {
                            let raft = master.raft.clone();
                            tokio::spawn(async move { raft.take_snapshot(index, data).await });
                        }
                        Err(err) => warn!(%err, "state snapshot serialization failed"),
                    }
                }
            }
            ApplyMsg::Snapshot { index, data } => match serde_json::from_value::<JobState>(data) {
                Ok(snapshot) => {
                    info!(index, "installing state snapshot");
                    *master.state.write().await = snapshot;
                    applied_tx.send_replace(index);
                }
                Err(err) => {
                    // Refusing to apply anything further keeps the damage
                    // visible instead of letting a half-restored replica
                    // answer queries.
                    error!(%err, "snapshot restore failed; restart this replica with --clean-start");
                    return;
                }
            },
        }
    }
}

/// Tracks elections. A new leader reconciles against the artifact store
/// before the serving gate opens; a deposed leader closes the gate and
/// drops its private overlays.
async fn leadership_loop(master: Arc<Master>) {
    let mut status_rx = master.raft.status_watch();
    loop {
        let status = status_rx.borrow_and_update().clone();
        let is_leader = status.role == Role::Leader;
        let serving = *master.serving.borrow();

        if is_leader && !serving {
            info!(term = status.term, "won leadership; reconciling before serving");
            while master.raft.is_leader() {
                match master.run_recovery().await {
                    Ok(()) => {
                        if master.raft.is_leader() {
                            master.serving.send_replace(true);
                            info!(term = status.term, "recovery done; serving workers");
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "recovery attempt failed; retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        } else if !is_leader && serving {
            info!("lost leadership; closing the serving gate");
            master.serving.send_replace(false);
            master.start_times.lock().await.clear();
        }

        if status_rx.changed().await.is_err() {
            break;
        }
    }
}
