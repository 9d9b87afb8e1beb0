//! Replicated state-machine commands.
//!
//! Every mutation of the task state machine rides the replication log as one
//! of these commands. The wire form is tagged JSON so replicas on different
//! builds stay compatible as long as the tags are.

use super::TaskKind;
use serde::{Deserialize, Serialize};

/// A command proposed through the replication log and applied on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Command {
    /// Mark a map task completed.
    CompleteMap { id: u32 },
    /// Mark a reduce task completed.
    CompleteReduce { id: u32 },
    /// Return a task to the idle pool. Plain resets only touch in-progress
    /// tasks; `invalidate` additionally demotes a completed task whose
    /// artifacts failed revalidation, correcting the done counter.
    ResetTask {
        id: u32,
        kind: TaskKind,
        #[serde(default)]
        invalidate: bool,
    },
    /// Add a replica to the cluster membership map.
    AddMaster {
        replication_addr: String,
        rpc_addr: String,
    },
    /// Remove a replica from the cluster membership map.
    RemoveMaster { replication_addr: String },
}

impl Command {
    /// Short human-readable form for logs.
    pub fn describe(&self) -> String {
        match self {
            Command::CompleteMap { id } => format!("complete-map({id})"),
            Command::CompleteReduce { id } => format!("complete-reduce({id})"),
            Command::ResetTask { id, kind, invalidate } => {
                format!("reset-task({kind} {id}, invalidate={invalidate})")
            }
            Command::AddMaster { replication_addr, .. } => {
                format!("add-master({replication_addr})")
            }
            Command::RemoveMaster { replication_addr } => {
                format!("remove-master({replication_addr})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_are_kebab_case() {
        let json = serde_json::to_value(Command::CompleteMap { id: 3 }).unwrap();
        assert_eq!(json["op"], "complete-map");

        let json = serde_json::to_value(Command::ResetTask {
            id: 1,
            kind: TaskKind::Reduce,
            invalidate: false,
        })
        .unwrap();
        assert_eq!(json["op"], "reset-task");
    }

    #[test]
    fn invalidate_defaults_to_false() {
        let cmd: Command =
            serde_json::from_str(r#"{"op":"reset-task","id":0,"kind":"map"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::ResetTask {
                id: 0,
                kind: TaskKind::Map,
                invalidate: false
            }
        );
    }

    #[test]
    fn round_trips_membership_commands() {
        let cmd = Command::AddMaster {
            replication_addr: "127.0.0.1:7003".into(),
            rpc_addr: "127.0.0.1:8003".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(serde_json::from_str::<Command>(&json).unwrap(), cmd);
    }
}
