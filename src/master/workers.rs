//! Leader-local worker records.
//!
//! Workers register implicitly on first contact and are refreshed by every
//! heartbeat or task interaction. Records are never replicated: a new leader
//! rebuilds its view from whatever workers talk to it next, and the liveness
//! monitor evicts the silent ones.

use crate::rpc::types::{TaskRef, WorkerInfo, WorkerStatus};
use crate::state::TaskKind;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    pub in_flight: HashSet<(TaskKind, u32)>,
    pub completed: u64,
}

#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerRecord>,
    heartbeat_interval: Duration,
    worker_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_interval: Duration, worker_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            heartbeat_interval,
            worker_timeout,
        }
    }

    /// Register or refresh a worker. Duplicate identities are last-writer-wins.
    pub fn observe(&mut self, worker_id: &str) {
        let now = Utc::now();
        self.workers
            .entry(worker_id.to_string())
            .and_modify(|w| w.last_seen = now)
            .or_insert_with(|| {
                debug!(worker = worker_id, "new worker registered");
                WorkerRecord {
                    id: worker_id.to_string(),
                    last_seen: now,
                    in_flight: HashSet::new(),
                    completed: 0,
                }
            });
    }

    pub fn record_assignment(&mut self, worker_id: &str, kind: TaskKind, task_id: u32) {
        self.observe(worker_id);
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.in_flight.insert((kind, task_id));
        }
    }

    pub fn record_completion(&mut self, worker_id: &str, kind: TaskKind, task_id: u32) {
        self.observe(worker_id);
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.in_flight.remove(&(kind, task_id));
            worker.completed += 1;
        }
    }

    /// Drop a task binding wherever it is held (reset paths).
    pub fn release_task(&mut self, kind: TaskKind, task_id: u32) {
        for worker in self.workers.values_mut() {
            worker.in_flight.remove(&(kind, task_id));
        }
    }

    /// Workers silent past the death threshold, with the tasks they held.
    pub fn expired(&self) -> Vec<(String, Vec<(TaskKind, u32)>)> {
        let now = Utc::now();
        self.workers
            .values()
            .filter(|w| age_of(w.last_seen, now) > self.worker_timeout)
            .map(|w| (w.id.clone(), w.in_flight.iter().copied().collect()))
            .collect()
    }

    pub fn evict(&mut self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.remove(worker_id)
    }

    pub fn status_of(&self, record: &WorkerRecord) -> WorkerStatus {
        let age = age_of(record.last_seen, Utc::now());
        if age <= self.heartbeat_interval * 2 {
            WorkerStatus::Active
        } else if age <= self.worker_timeout {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Failed
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn tasks_of(&self, worker_id: &str) -> Vec<TaskRef> {
        self.workers
            .get(worker_id)
            .map(|w| {
                let mut tasks: Vec<TaskRef> = w
                    .in_flight
                    .iter()
                    .map(|(kind, id)| TaskRef { kind: *kind, id: *id })
                    .collect();
                tasks.sort_by_key(|t| (t.kind, t.id));
                tasks
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .values()
            .map(|w| WorkerInfo {
                id: w.id.clone(),
                status: self.status_of(w),
                last_seen: w.last_seen,
                in_flight: {
                    let mut tasks: Vec<TaskRef> = w
                        .in_flight
                        .iter()
                        .map(|(kind, id)| TaskRef { kind: *kind, id: *id })
                        .collect();
                    tasks.sort_by_key(|t| (t.kind, t.id));
                    tasks
                },
                completed: w.completed,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

fn age_of(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(last_seen)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
