//! Leader-election recovery.
//!
//! A new leader must not trust the state vector it inherited: workers kept
//! writing artifacts while the old leader died, and in-progress overlays
//! were leader-private and are gone. Before serving, reconcile every task of
//! the current phase against the disk and push the corrections through the
//! replication log so all replicas converge. Counters and phase transitions
//! fix themselves through normal command application.

use super::Master;
use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::state::{Command, JobState, TaskKind, TaskState};
use tracing::{info, warn};

/// Corrections needed to make the state vector agree with the artifacts.
pub(crate) fn reconciliation_commands(state: &JobState, store: &ArtifactStore) -> Vec<Command> {
    let Some(kind) = state.current_kind() else {
        return Vec::new();
    };
    let tasks = match kind {
        TaskKind::Map => &state.map_tasks,
        TaskKind::Reduce => &state.reduce_tasks,
    };

    let mut commands = Vec::new();
    for (id, task) in tasks.iter().enumerate() {
        let id = id as u32;
        let artifacts_valid = match kind {
            TaskKind::Map => store.map_artifacts_valid(id, state.n_reduce),
            TaskKind::Reduce => store.reduce_artifact_valid(id),
        };
        match (task, artifacts_valid) {
            (TaskState::Completed, false) => commands.push(Command::ResetTask {
                id,
                kind,
                invalidate: true,
            }),
            (TaskState::InProgress, true) => commands.push(match kind {
                TaskKind::Map => Command::CompleteMap { id },
                TaskKind::Reduce => Command::CompleteReduce { id },
            }),
            (TaskState::InProgress, false) => commands.push(Command::ResetTask {
                id,
                kind,
                invalidate: false,
            }),
            _ => {}
        }
    }
    commands
}

impl Master {
    /// Run reconciliation after winning an election. Idempotent; returns an
    /// error only if leadership is lost before every correction commits.
    pub(crate) async fn run_recovery(&self) -> Result<()> {
        let commands = {
            let state = self.state.read().await;
            reconciliation_commands(&state, &self.store)
        };
        if commands.is_empty() {
            info!("recovery: state vector agrees with artifacts");
            return Ok(());
        }
        info!(corrections = commands.len(), "recovery: reconciling state with artifacts");

        for cmd in commands {
            // Invalidated completions also get their remnants scrubbed so a
            // re-run starts from a clean slate.
            if let Command::ResetTask {
                id,
                kind,
                invalidate: true,
            } = &cmd
            {
                let n_reduce = self.state.read().await.n_reduce;
                match kind {
                    TaskKind::Map => self.store.clean_map_artifacts(*id, n_reduce).await,
                    TaskKind::Reduce => self.store.clean_reduce_artifacts(*id).await,
                }
            }
            if let Err(err) = self.commit(cmd).await {
                warn!(%err, "recovery interrupted");
                return Err(err);
            }
        }
        info!("recovery complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::KeyValue;
    use crate::state::Phase;
    use tempfile::TempDir;

    fn kv(key: &str) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: "1".into(),
        }
    }

    #[tokio::test]
    async fn completed_without_artifacts_is_invalidated() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let mut state = JobState::new_job(vec!["a".into(), "b".into()], 1);
        state.map_tasks[0] = TaskState::Completed;
        state.map_done = 1;

        let commands = reconciliation_commands(&state, &store);
        assert_eq!(
            commands,
            vec![Command::ResetTask {
                id: 0,
                kind: TaskKind::Map,
                invalidate: true
            }]
        );
    }

    #[tokio::test]
    async fn in_progress_with_artifacts_is_promoted() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let mut state = JobState::new_job(vec!["a".into(), "b".into()], 1);
        state.map_tasks[1] = TaskState::InProgress;
        store.write_intermediate(1, 0, &[kv("x")]).await.unwrap();

        let commands = reconciliation_commands(&state, &store);
        assert_eq!(commands, vec![Command::CompleteMap { id: 1 }]);
    }

    #[tokio::test]
    async fn in_progress_without_artifacts_is_reverted() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let mut state = JobState::new_job(vec!["a".into()], 1);
        state.map_tasks[0] = TaskState::InProgress;

        let commands = reconciliation_commands(&state, &store);
        assert_eq!(
            commands,
            vec![Command::ResetTask {
                id: 0,
                kind: TaskKind::Map,
                invalidate: false
            }]
        );
    }

    #[tokio::test]
    async fn reduce_phase_reconciles_outputs() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let mut state = JobState::new_job(vec!["a".into()], 2);
        state.phase = Phase::Reduce;
        state.map_tasks[0] = TaskState::Completed;
        state.map_done = 1;
        state.reduce_tasks[0] = TaskState::InProgress;
        state.reduce_tasks[1] = TaskState::Completed;
        state.reduce_done = 1;

        // Reduce 0 finished on disk; reduce 1 claims completion with nothing
        // to show for it.
        tokio::fs::write(store.output_path(0), "a 1\n").await.unwrap();

        let commands = reconciliation_commands(&state, &store);
        assert_eq!(commands.len(), 2);
        assert!(commands.contains(&Command::CompleteReduce { id: 0 }));
        assert!(commands.contains(&Command::ResetTask {
            id: 1,
            kind: TaskKind::Reduce,
            invalidate: true
        }));
    }

    #[tokio::test]
    async fn clean_state_needs_no_corrections() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let state = JobState::new_job(vec!["a".into()], 1);
        assert!(reconciliation_commands(&state, &store).is_empty());
    }
}
