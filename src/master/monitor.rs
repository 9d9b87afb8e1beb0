//! Liveness monitoring: three periodic leader-only scans.
//!
//! Each scan computes reset or completion proposals and feeds them through
//! the replication log; none of them mutates the state machine directly.
//! Duplicate resets are harmless because the apply rules are idempotent.

use super::Master;
use crate::artifact::ArtifactStore;
use crate::state::{Command, JobState, TaskKind, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often in-progress tasks are checked against the task timeout.
pub const TASK_SCAN_PERIOD: Duration = Duration::from_secs(2);
/// How often completed tasks have their artifacts revalidated.
pub const REVALIDATION_PERIOD: Duration = Duration::from_secs(10);
/// How often worker last-seen ages are checked.
pub const WORKER_SCAN_PERIOD: Duration = Duration::from_secs(5);

/// Tasks in progress longer than `timeout`, as plain reset proposals.
pub(crate) fn timed_out_tasks(
    state: &JobState,
    start_times: &HashMap<(TaskKind, u32), Instant>,
    timeout: Duration,
    now: Instant,
) -> Vec<Command> {
    let Some(kind) = state.current_kind() else {
        return Vec::new();
    };
    let tasks = match kind {
        TaskKind::Map => &state.map_tasks,
        TaskKind::Reduce => &state.reduce_tasks,
    };
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == TaskState::InProgress)
        .filter(|(id, _)| {
            // A task with no recorded start was inherited from a previous
            // leadership; treat it as overdue.
            start_times
                .get(&(kind, *id as u32))
                .map(|started| now.duration_since(*started) > timeout)
                .unwrap_or(true)
        })
        .map(|(id, _)| Command::ResetTask {
            id: id as u32,
            kind,
            invalidate: false,
        })
        .collect()
}

/// Completed tasks of the current phase whose artifacts no longer validate.
pub(crate) fn revalidation_failures(state: &JobState, store: &ArtifactStore) -> Vec<(TaskKind, u32)> {
    let Some(kind) = state.current_kind() else {
        return Vec::new();
    };
    let tasks = match kind {
        TaskKind::Map => &state.map_tasks,
        TaskKind::Reduce => &state.reduce_tasks,
    };
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == TaskState::Completed)
        .filter(|(id, _)| match kind {
            TaskKind::Map => !store.map_artifacts_valid(*id as u32, state.n_reduce),
            TaskKind::Reduce => !store.reduce_artifact_valid(*id as u32),
        })
        .map(|(id, _)| (kind, id as u32))
        .collect()
}

/// Spawn the three scan daemons for the life of the process.
pub(crate) fn spawn_scans(master: Arc<Master>) {
    tokio::spawn(task_timeout_scan(master.clone()));
    tokio::spawn(revalidation_scan(master.clone()));
    tokio::spawn(worker_death_scan(master));
}

async fn task_timeout_scan(master: Arc<Master>) {
    let mut ticker = tokio::time::interval(TASK_SCAN_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !master.is_serving_leader() {
            continue;
        }
        let proposals = {
            let state = master.state.read().await;
            let start_times = master.start_times.lock().await;
            timed_out_tasks(&state, &start_times, master.config.task_timeout, Instant::now())
        };
        for cmd in proposals {
            info!(cmd = %cmd.describe(), "task timed out");
            if let Err(err) = master.commit(cmd).await {
                warn!(%err, "timeout reset failed; will retry next scan");
                break;
            }
        }
    }
}

async fn revalidation_scan(master: Arc<Master>) {
    let mut ticker = tokio::time::interval(REVALIDATION_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !master.is_serving_leader() {
            continue;
        }
        let failures = {
            let state = master.state.read().await;
            revalidation_failures(&state, &master.store)
        };
        for (kind, id) in failures {
            warn!(%kind, id, "completed task failed artifact revalidation");
            // Scrub the rot before anyone re-reads it, then demote the task.
            let n_reduce = master.state.read().await.n_reduce;
            match kind {
                TaskKind::Map => master.store.clean_map_artifacts(id, n_reduce).await,
                TaskKind::Reduce => master.store.clean_reduce_artifacts(id).await,
            }
            let cmd = Command::ResetTask {
                id,
                kind,
                invalidate: true,
            };
            if let Err(err) = master.commit(cmd).await {
                warn!(%err, "revalidation reset failed; will retry next scan");
                break;
            }
        }
    }
}

async fn worker_death_scan(master: Arc<Master>) {
    let mut ticker = tokio::time::interval(WORKER_SCAN_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !master.is_serving_leader() {
            continue;
        }
        let expired = master.workers.lock().await.expired();
        for (worker_id, held_tasks) in expired {
            warn!(worker = %worker_id, tasks = held_tasks.len(), "worker presumed dead, evicting");
            master.workers.lock().await.evict(&worker_id);

            for (kind, id) in held_tasks {
                let in_progress = {
                    let state = master.state.read().await;
                    state.task(kind, id) == Some(TaskState::InProgress)
                };
                if !in_progress {
                    continue;
                }
                // Any reduce checkpoint stays on disk and in the checkpoint
                // map so the reassignment picks up where the dead worker
                // left off.
                debug!(%kind, id, "resetting task held by dead worker");
                let cmd = Command::ResetTask {
                    id,
                    kind,
                    invalidate: false,
                };
                if let Err(err) = master.commit(cmd).await {
                    warn!(%err, "dead-worker reset failed; will retry next scan");
                }
            }
        }
    }
}
