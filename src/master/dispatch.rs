//! Leader-only task dispatch.
//!
//! One scan walks the current phase's tasks in id order and produces two
//! things: commands to propose (completions discovered on disk, resets of
//! rotted completions) and at most one assignment. Artifacts on disk are the
//! ground truth; the state vector only says who to ask.

use super::Master;
use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::rpc::types::TaskAssignment;
use crate::state::{Command, JobState, Phase, TaskKind, TaskState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of one dispatch scan.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    /// Commands that must commit regardless of what gets assigned.
    pub proposals: Vec<Command>,
    /// The task picked for the requesting worker, if any.
    pub assignment: Option<TaskAssignment>,
    /// Phase is Done: tell the worker to exit.
    pub exit: bool,
}

/// Walk the current phase looking for work. Mutates `state` only to flip the
/// picked task to in-progress (a leader-local overlay, never replicated).
pub(crate) fn scan_for_assignment(
    state: &mut JobState,
    store: &ArtifactStore,
    start_times: &mut HashMap<(TaskKind, u32), Instant>,
    checkpoints: &HashMap<u32, PathBuf>,
) -> Scan {
    let mut scan = Scan::default();
    match state.phase {
        Phase::Done => {
            scan.exit = true;
            scan
        }
        Phase::Map => {
            scan_phase(&mut scan, state, store, start_times, TaskKind::Map, checkpoints);
            scan
        }
        Phase::Reduce => {
            // Reduce dispatch requires every map task's intermediates to
            // revalidate, not just the counters saying they once did.
            if !store.all_map_artifacts_valid(state.n_map(), state.n_reduce) {
                debug!("holding reduce dispatch: map artifacts failed revalidation");
                return scan;
            }
            scan_phase(&mut scan, state, store, start_times, TaskKind::Reduce, checkpoints);
            scan
        }
    }
}

fn scan_phase(
    scan: &mut Scan,
    state: &mut JobState,
    store: &ArtifactStore,
    start_times: &mut HashMap<(TaskKind, u32), Instant>,
    kind: TaskKind,
    checkpoints: &HashMap<u32, PathBuf>,
) {
    let n_map = state.n_map();
    let n_reduce = state.n_reduce;
    let count = match kind {
        TaskKind::Map => n_map,
        TaskKind::Reduce => n_reduce,
    };

    for id in 0..count {
        let Some(task) = state.task(kind, id) else {
            continue;
        };
        let artifacts_valid = match kind {
            TaskKind::Map => store.map_artifacts_valid(id, n_reduce),
            TaskKind::Reduce => store.reduce_artifact_valid(id),
        };

        match (task, artifacts_valid) {
            (TaskState::Completed, true) => {}
            (TaskState::Completed, false) => {
                // Rotted completion: demote it, a later request re-runs it.
                scan.proposals.push(Command::ResetTask {
                    id,
                    kind,
                    invalidate: true,
                });
            }
            (TaskState::Idle, true) | (TaskState::InProgress, true) => {
                // Work already finished on disk (resumed run, or the worker
                // died after writing but before reporting). Record it
                // instead of re-dispatching.
                scan.proposals.push(match kind {
                    TaskKind::Map => Command::CompleteMap { id },
                    TaskKind::Reduce => Command::CompleteReduce { id },
                });
            }
            (TaskState::Idle, false) => {
                if scan.assignment.is_none() {
                    let tasks = match kind {
                        TaskKind::Map => &mut state.map_tasks,
                        TaskKind::Reduce => &mut state.reduce_tasks,
                    };
                    tasks[id as usize] = TaskState::InProgress;
                    start_times.insert((kind, id), Instant::now());
                    scan.assignment = Some(match kind {
                        TaskKind::Map => TaskAssignment::Map {
                            id,
                            input: state.inputs[id as usize].clone(),
                            n_reduce,
                        },
                        TaskKind::Reduce => TaskAssignment::Reduce {
                            id,
                            n_map,
                            checkpoint: checkpoints
                                .get(&id)
                                .map(|p| p.to_string_lossy().into_owned()),
                        },
                    });
                }
            }
            (TaskState::InProgress, false) => {
                // Still someone else's until the timeout monitor says otherwise.
            }
        }
    }
}

impl Master {
    /// AssignTask. Leader-only; followers get a not-leader redirect from the
    /// RPC layer before reaching here.
    pub async fn assign_task(&self, worker_id: &str) -> Result<TaskAssignment> {
        self.ensure_serving_leader().await?;
        self.workers.lock().await.observe(worker_id);

        // Proposals discovered by a scan must commit before the picture is
        // final, so re-scan after each batch. The loop is bounded: every
        // committed batch strictly shrinks the set of unfinished tasks.
        for _ in 0..4 {
            let scan = {
                let mut state = self.state.write().await;
                let mut start_times = self.start_times.lock().await;
                let checkpoints = self.checkpoints.lock().await;
                scan_for_assignment(&mut state, &self.store, &mut start_times, &checkpoints)
            };

            if scan.exit {
                return Ok(TaskAssignment::Exit);
            }
            let had_proposals = !scan.proposals.is_empty();
            for cmd in scan.proposals {
                self.commit(cmd).await?;
            }
            if let Some(assignment) = scan.assignment {
                if let Some((kind, id)) = assignment_key(&assignment) {
                    self.workers
                        .lock()
                        .await
                        .record_assignment(worker_id, kind, id);
                    info!(worker = worker_id, %kind, id, "task assigned");
                }
                return Ok(assignment);
            }
            if !had_proposals {
                return Ok(TaskAssignment::NoTask);
            }
        }
        Ok(TaskAssignment::NoTask)
    }
}

fn assignment_key(assignment: &TaskAssignment) -> Option<(TaskKind, u32)> {
    match assignment {
        TaskAssignment::Map { id, .. } => Some((TaskKind::Map, *id)),
        TaskAssignment::Reduce { id, .. } => Some((TaskKind::Reduce, *id)),
        TaskAssignment::NoTask | TaskAssignment::Exit => None,
    }
}
