//! The authoritative task state machine.
//!
//! `JobState` is a deterministic automaton: replicas feed it the same
//! committed command sequence and end up byte-identical. It never touches the
//! filesystem; artifact checks happen in the dispatcher and monitor, which
//! only ever *propose* commands. Task start times and worker bindings are
//! leader-private and deliberately absent from this structure.

mod command;

pub use command::Command;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Global job stage. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Map,
    Reduce,
    Done,
}

/// Per-task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    InProgress,
    Completed,
}

/// Which of the two fixed phases a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Map,
    Reduce,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Map => write!(f, "map"),
            TaskKind::Reduce => write!(f, "reduce"),
        }
    }
}

/// Addresses of one master replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAddrs {
    pub replication: String,
    pub rpc: String,
}

/// The replicated job state. Serialized wholesale into snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub phase: Phase,
    /// Input shard per map task; fixed at submission. M = inputs.len().
    pub inputs: Vec<String>,
    /// Reducer fan-out N; fixed at submission.
    pub n_reduce: u32,
    pub map_tasks: Vec<TaskState>,
    pub reduce_tasks: Vec<TaskState>,
    pub map_done: u32,
    pub reduce_done: u32,
    /// Replica membership keyed by replication address. BTreeMap keeps the
    /// serialized form identical across replicas.
    pub membership: BTreeMap<String, ReplicaAddrs>,
}

impl JobState {
    /// An uninitialized state machine; task commands are ignored until a job
    /// is loaded (log-replay safety during bootstrap).
    pub fn empty() -> Self {
        Self {
            phase: Phase::Map,
            inputs: Vec::new(),
            n_reduce: 0,
            map_tasks: Vec::new(),
            reduce_tasks: Vec::new(),
            map_done: 0,
            reduce_done: 0,
            membership: BTreeMap::new(),
        }
    }

    /// State for a freshly submitted job: every task idle, phase Map.
    pub fn new_job(inputs: Vec<String>, n_reduce: u32) -> Self {
        let n_map = inputs.len();
        Self {
            phase: Phase::Map,
            inputs,
            n_reduce,
            map_tasks: vec![TaskState::Idle; n_map],
            reduce_tasks: vec![TaskState::Idle; n_reduce as usize],
            map_done: 0,
            reduce_done: 0,
            membership: BTreeMap::new(),
        }
    }

    pub fn n_map(&self) -> u32 {
        self.inputs.len() as u32
    }

    pub fn is_initialized(&self) -> bool {
        !self.inputs.is_empty()
    }

    /// The kind of task the current phase dispatches.
    pub fn current_kind(&self) -> Option<TaskKind> {
        match self.phase {
            Phase::Map => Some(TaskKind::Map),
            Phase::Reduce => Some(TaskKind::Reduce),
            Phase::Done => None,
        }
    }

    pub fn task(&self, kind: TaskKind, id: u32) -> Option<TaskState> {
        match kind {
            TaskKind::Map => self.map_tasks.get(id as usize).copied(),
            TaskKind::Reduce => self.reduce_tasks.get(id as usize).copied(),
        }
    }

    /// Apply one committed command. Deterministic and infallible: malformed
    /// or out-of-context commands are no-ops, so a replayed log can never
    /// wedge a replica.
    pub fn apply(&mut self, cmd: &Command) {
        match cmd {
            Command::AddMaster {
                replication_addr,
                rpc_addr,
            } => {
                self.membership.insert(
                    replication_addr.clone(),
                    ReplicaAddrs {
                        replication: replication_addr.clone(),
                        rpc: rpc_addr.clone(),
                    },
                );
                info!(replica = %replication_addr, "membership: added master");
            }
            Command::RemoveMaster { replication_addr } => {
                if self.membership.remove(replication_addr).is_some() {
                    info!(replica = %replication_addr, "membership: removed master");
                }
            }
            _ if !self.is_initialized() || self.phase == Phase::Done => {
                debug!(cmd = %cmd.describe(), "ignoring command outside an active job");
            }
            Command::CompleteMap { id } => self.complete(TaskKind::Map, *id),
            Command::CompleteReduce { id } => self.complete(TaskKind::Reduce, *id),
            Command::ResetTask {
                id,
                kind,
                invalidate,
            } => self.reset(*kind, *id, *invalidate),
        }
    }

    fn complete(&mut self, kind: TaskKind, id: u32) {
        let (tasks, done) = match kind {
            TaskKind::Map => (&mut self.map_tasks, &mut self.map_done),
            TaskKind::Reduce => (&mut self.reduce_tasks, &mut self.reduce_done),
        };
        let Some(task) = tasks.get_mut(id as usize) else {
            debug!(%kind, id, "completion for out-of-range task ignored");
            return;
        };
        if *task == TaskState::Completed {
            debug!(%kind, id, "duplicate completion ignored");
            return;
        }
        *task = TaskState::Completed;
        *done += 1;
        debug!(%kind, id, done = *done, "task completed");

        if kind == TaskKind::Map && self.map_done == self.n_map() && self.phase == Phase::Map {
            self.phase = Phase::Reduce;
            info!("all map tasks done, entering reduce phase");
        }
        if kind == TaskKind::Reduce
            && self.reduce_done == self.n_reduce
            && self.phase == Phase::Reduce
        {
            self.phase = Phase::Done;
            info!("all reduce tasks done, job complete");
        }
    }

    fn reset(&mut self, kind: TaskKind, id: u32, invalidate: bool) {
        // A reset only addresses the phase currently dispatching that kind;
        // anything else could walk the phase backwards.
        if self.current_kind() != Some(kind) {
            debug!(%kind, id, "reset for non-current phase ignored");
            return;
        }
        let (tasks, done) = match kind {
            TaskKind::Map => (&mut self.map_tasks, &mut self.map_done),
            TaskKind::Reduce => (&mut self.reduce_tasks, &mut self.reduce_done),
        };
        let Some(task) = tasks.get_mut(id as usize) else {
            return;
        };
        match *task {
            TaskState::InProgress => {
                *task = TaskState::Idle;
                info!(%kind, id, "task reset to idle");
            }
            TaskState::Completed if invalidate => {
                *task = TaskState::Idle;
                *done = done.saturating_sub(1);
                info!(%kind, id, done = *done, "completed task invalidated");
            }
            _ => {}
        }
    }

    /// Counter/state-vector agreement, used by tests and debug assertions.
    pub fn counters_consistent(&self) -> bool {
        let maps = self
            .map_tasks
            .iter()
            .filter(|t| **t == TaskState::Completed)
            .count() as u32;
        let reduces = self
            .reduce_tasks
            .iter()
            .filter(|t| **t == TaskState::Completed)
            .count() as u32;
        maps == self.map_done && reduces == self.reduce_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_by_two() -> JobState {
        JobState::new_job(vec!["in-0".into(), "in-1".into(), "in-2".into()], 2)
    }

    #[test]
    fn uninitialized_state_ignores_task_commands() {
        let mut state = JobState::empty();
        state.apply(&Command::CompleteMap { id: 0 });
        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Map,
            invalidate: true,
        });
        assert_eq!(state, JobState::empty());
    }

    #[test]
    fn membership_commands_apply_even_when_uninitialized() {
        let mut state = JobState::empty();
        state.apply(&Command::AddMaster {
            replication_addr: "127.0.0.1:7001".into(),
            rpc_addr: "127.0.0.1:8001".into(),
        });
        assert_eq!(state.membership.len(), 1);

        state.apply(&Command::RemoveMaster {
            replication_addr: "127.0.0.1:7001".into(),
        });
        assert!(state.membership.is_empty());
    }

    #[test]
    fn map_completions_advance_phase() {
        let mut state = three_by_two();
        for id in 0..3 {
            assert_eq!(state.phase, Phase::Map);
            state.apply(&Command::CompleteMap { id });
        }
        assert_eq!(state.phase, Phase::Reduce);
        assert_eq!(state.map_done, 3);
        assert!(state.counters_consistent());
    }

    #[test]
    fn reduce_completions_finish_the_job() {
        let mut state = three_by_two();
        for id in 0..3 {
            state.apply(&Command::CompleteMap { id });
        }
        state.apply(&Command::CompleteReduce { id: 0 });
        assert_eq!(state.phase, Phase::Reduce);
        state.apply(&Command::CompleteReduce { id: 1 });
        assert_eq!(state.phase, Phase::Done);
    }

    #[test]
    fn double_completion_is_a_no_op() {
        let mut state = three_by_two();
        state.apply(&Command::CompleteMap { id: 1 });
        state.apply(&Command::CompleteMap { id: 1 });
        assert_eq!(state.map_done, 1);
        assert_eq!(state.phase, Phase::Map);
        assert!(state.counters_consistent());
    }

    #[test]
    fn commands_after_done_are_ignored() {
        let mut state = JobState::new_job(vec!["in-0".into()], 1);
        state.apply(&Command::CompleteMap { id: 0 });
        state.apply(&Command::CompleteReduce { id: 0 });
        assert_eq!(state.phase, Phase::Done);

        let frozen = state.clone();
        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Reduce,
            invalidate: true,
        });
        state.apply(&Command::CompleteMap { id: 0 });
        assert_eq!(state, frozen);
    }

    #[test]
    fn plain_reset_only_touches_in_progress() {
        let mut state = three_by_two();
        state.map_tasks[0] = TaskState::InProgress;
        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Map,
            invalidate: false,
        });
        assert_eq!(state.map_tasks[0], TaskState::Idle);

        // Idle: no-op.
        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Map,
            invalidate: false,
        });
        assert_eq!(state.map_tasks[0], TaskState::Idle);

        // Completed + plain reset: no-op.
        state.apply(&Command::CompleteMap { id: 1 });
        state.apply(&Command::ResetTask {
            id: 1,
            kind: TaskKind::Map,
            invalidate: false,
        });
        assert_eq!(state.map_tasks[1], TaskState::Completed);
        assert_eq!(state.map_done, 1);
    }

    #[test]
    fn invalidating_reset_demotes_completed_and_corrects_counter() {
        let mut state = three_by_two();
        state.apply(&Command::CompleteMap { id: 0 });
        assert_eq!(state.map_done, 1);

        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Map,
            invalidate: true,
        });
        assert_eq!(state.map_tasks[0], TaskState::Idle);
        assert_eq!(state.map_done, 0);
        assert!(state.counters_consistent());
    }

    #[test]
    fn reset_for_non_current_phase_is_ignored() {
        let mut state = three_by_two();
        for id in 0..3 {
            state.apply(&Command::CompleteMap { id });
        }
        assert_eq!(state.phase, Phase::Reduce);

        // A stale invalidation of a map task cannot drag the phase backwards.
        state.apply(&Command::ResetTask {
            id: 0,
            kind: TaskKind::Map,
            invalidate: true,
        });
        assert_eq!(state.phase, Phase::Reduce);
        assert_eq!(state.map_done, 3);
        assert_eq!(state.map_tasks[0], TaskState::Completed);
    }

    #[test]
    fn snapshot_round_trip_is_byte_identical() {
        let mut state = three_by_two();
        state.apply(&Command::CompleteMap { id: 2 });
        state.apply(&Command::AddMaster {
            replication_addr: "127.0.0.1:7001".into(),
            rpc_addr: "127.0.0.1:8001".into(),
        });

        let bytes = serde_json::to_vec(&state).unwrap();
        let restored: JobState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, state);
        assert_eq!(serde_json::to_vec(&restored).unwrap(), bytes);
    }
}
