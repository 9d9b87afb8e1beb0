//! Wire types for the worker-facing RPC surface.
//!
//! Every response rides a discriminated envelope so callers match on the
//! outcome instead of parsing error strings: `ok`, `not_leader` with a
//! redirect hint, `retry` for transient conditions, `fatal` for errors that
//! retrying the same call cannot fix.

use crate::error::Error;
use crate::raft::Role;
use crate::state::TaskKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The discriminated result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse<T> {
    Ok { value: T },
    NotLeader { leader_hint: Option<String> },
    Retry { reason: String },
    Fatal { reason: String },
}

impl<T> RpcResponse<T> {
    pub fn ok(value: T) -> Self {
        RpcResponse::Ok { value }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NotLeader(hint) => RpcResponse::NotLeader {
                leader_hint: hint.clone(),
            },
            err if err.is_retriable() => RpcResponse::Retry {
                reason: err.to_string(),
            },
            err => RpcResponse::Fatal {
                reason: err.to_string(),
            },
        }
    }
}

impl<T> From<Result<T, Error>> for RpcResponse<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => RpcResponse::ok(value),
            Err(err) => RpcResponse::from_error(&err),
        }
    }
}

/// What the dispatcher hands a requesting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskAssignment {
    Map {
        id: u32,
        /// Input shard this map task consumes.
        input: String,
        n_reduce: u32,
    },
    Reduce {
        id: u32,
        n_map: u32,
        /// Checkpoint path to resume from, if one is recorded.
        checkpoint: Option<String>,
    },
    /// Nothing assignable right now; poll again shortly.
    NoTask,
    /// The job is done; the worker should exit.
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub task_id: u32,
    pub kind: TaskKind,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub task_id: u32,
    pub kind: TaskKind,
    /// Free-form operator reason. `checkpoint=<path>` is parsed and recorded
    /// in the per-task checkpoint map before the reset applies.
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTasksRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMasterRequest {
    pub replication_addr: String,
    pub rpc_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMasterRequest {
    pub replication_addr: String,
}

/// Acknowledgement payload for calls with nothing else to say.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterInfo {
    pub my_id: usize,
    pub is_leader: bool,
    /// RPC address of the best-known leader.
    pub leader_addr: Option<String>,
    pub raft_state: Role,
    pub term: u64,
    /// Last time this replica heard from a leader.
    pub last_seen: DateTime<Utc>,
}

/// Derived worker health, from last-seen age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub kind: TaskKind,
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub last_seen: DateTime<Utc>,
    pub in_flight: Vec<TaskRef>,
    pub completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCount {
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_discriminants_serialize_by_status() {
        let ok: RpcResponse<Ack> = RpcResponse::ok(Ack {});
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");

        let not_leader: RpcResponse<Ack> = RpcResponse::NotLeader {
            leader_hint: Some("127.0.0.1:8002".into()),
        };
        let json = serde_json::to_value(&not_leader).unwrap();
        assert_eq!(json["status"], "not_leader");
        assert_eq!(json["leader_hint"], "127.0.0.1:8002");
    }

    #[test]
    fn errors_map_onto_the_right_variant() {
        let resp: RpcResponse<Ack> = RpcResponse::from_error(&Error::NotLeader(None));
        assert!(matches!(resp, RpcResponse::NotLeader { .. }));

        let resp: RpcResponse<Ack> =
            RpcResponse::from_error(&Error::Unavailable("recovering".into()));
        assert!(matches!(resp, RpcResponse::Retry { .. }));

        let resp: RpcResponse<Ack> =
            RpcResponse::from_error(&Error::Io(std::io::Error::other("disk hiccup")));
        assert!(matches!(resp, RpcResponse::Retry { .. }));

        let resp: RpcResponse<Ack> =
            RpcResponse::from_error(&Error::Validation("bad artifact".into()));
        assert!(matches!(resp, RpcResponse::Fatal { .. }));
    }

    #[test]
    fn assignment_wire_form_is_tagged() {
        let task = TaskAssignment::Reduce {
            id: 1,
            n_map: 3,
            checkpoint: None,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "reduce");

        let back: TaskAssignment = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
