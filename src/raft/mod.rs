//! Leader-based replicated log.
//!
//! The master proposes opaque state-machine commands here; once a quorum of
//! replicas has them durably, they are delivered in identical order to every
//! replica's apply loop. Exactly one leader exists per term, elected with
//! randomized timeouts. Snapshots carry the whole state machine so a fresh
//! or lagging replica catches up without replaying history.

pub mod log;
mod node;
mod storage;
mod transport;

pub use storage::PersistedSnapshot;

use crate::error::{Error, Result};
use crate::state::Command;
use axum::Router;
use chrono::{DateTime, Utc};
use self::log::EntryPayload;
use node::{RaftEvent, RaftNode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Default heartbeat period for the leader.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(200);
/// Base election timeout; a random jitter is added per node per election.
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(300);
/// Width of the per-election random jitter window.
pub const DEFAULT_ELECTION_JITTER: Duration = Duration::from_millis(300);

/// Where a replica stands in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

/// Snapshot of the node's externally visible state, published on a watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub role: Role,
    pub term: u64,
    /// Replication address of the best-known leader.
    pub leader_hint: Option<String>,
    /// Last time this replica heard from a leader (or became one).
    pub last_leader_contact: DateTime<Utc>,
}

impl Default for RaftStatus {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            leader_hint: None,
            last_leader_contact: Utc::now(),
        }
    }
}

/// What the apply loop receives, in commit order.
#[derive(Debug)]
pub enum ApplyMsg {
    /// A committed command to apply.
    Command {
        index: u64,
        command: serde_json::Value,
    },
    /// A full state-machine image replacing everything up to `index`.
    Snapshot {
        index: u64,
        data: serde_json::Value,
    },
}

/// Static configuration for one replication node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This replica's replication address; doubles as its identity.
    pub my_addr: String,
    /// Replication addresses of every replica, this one included.
    pub peers: Vec<String>,
    pub data_dir: PathBuf,
    pub clean_start: bool,
    pub heartbeat_interval: Duration,
    pub election_timeout_base: Duration,
    pub election_timeout_jitter: Duration,
}

impl RaftConfig {
    pub fn new(my_addr: String, peers: Vec<String>, data_dir: PathBuf) -> Self {
        Self {
            my_addr,
            peers,
            data_dir,
            clean_start: false,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            election_timeout_base: DEFAULT_ELECTION_TIMEOUT,
            election_timeout_jitter: DEFAULT_ELECTION_JITTER,
        }
    }
}

/// Cheap cloneable handle to a running replication node.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    events: mpsc::Sender<RaftEvent>,
    status: watch::Receiver<RaftStatus>,
}

impl RaftHandle {
    /// Propose a command. Resolves with its log index once a quorum has it
    /// and it is on its way to every apply loop, or fails retriably.
    pub async fn propose(&self, command: &Command) -> Result<u64> {
        let payload = EntryPayload::Command(serde_json::to_value(command)?);
        let (tx, rx) = oneshot::channel();
        self.events
            .send(RaftEvent::Propose { payload, reply: tx })
            .await
            .map_err(|_| Error::Replication("replication node is gone".into()))?;
        rx.await
            .map_err(|_| Error::Replication("proposal dropped during leader change".into()))?
    }

    /// Current externally visible node state.
    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    /// Watch for role and term changes.
    pub fn status_watch(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Push a membership change down to the replication layer.
    pub async fn set_peers(&self, peers: Vec<String>) {
        let _ = self.events.send(RaftEvent::SetPeers(peers)).await;
    }

    /// Hand the state-machine image at `last_index` to the node so it can
    /// compact its log.
    pub async fn take_snapshot(&self, last_index: u64, data: serde_json::Value) {
        let _ = self
            .events
            .send(RaftEvent::TakeSnapshot { last_index, data })
            .await;
    }

    /// Ask the leader to hand leadership to its best-caught-up peer.
    pub async fn transfer_leadership(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(RaftEvent::Transfer(tx))
            .await
            .map_err(|_| Error::Replication("replication node is gone".into()))?;
        rx.await
            .map_err(|_| Error::Replication("replication node is gone".into()))?
    }

    /// The HTTP router peers talk to. Bind it on the replication address.
    pub fn replication_router(&self) -> Router {
        transport::replication_router(self.events.clone())
    }

    /// Stop the node loop. In-flight proposals fail retriably.
    pub async fn shutdown(&self) {
        let _ = self.events.send(RaftEvent::Shutdown).await;
    }
}

/// Start a replication node. Committed commands and snapshots arrive on
/// `apply_tx` in order; the caller owns the state machine they feed.
pub async fn spawn(config: RaftConfig, apply_tx: mpsc::Sender<ApplyMsg>) -> Result<RaftHandle> {
    let (events_tx, events_rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(RaftStatus::default());
    let node = RaftNode::new(config, events_tx.clone(), events_rx, apply_tx, status_tx).await?;
    tokio::spawn(node.run());
    Ok(RaftHandle {
        events: events_tx,
        status: status_rx,
    })
}
