//! The replication core: one task per replica owning all raft state.
//!
//! Everything funnels through a single event channel: inbound peer RPCs,
//! proposals from the master, responses from outbound calls, and membership
//! updates. Network I/O happens in short-lived spawned tasks that report back
//! as events, so the node itself never blocks on a peer.

use super::log::{EntryPayload, LogEntry, RaftLog};
use super::storage::{HardState, PersistedSnapshot, RaftStorage};
use super::transport::{
    AppendRequest, AppendResponse, PeerClient, SnapshotRequest, SnapshotResponse, TimeoutNowRequest,
    VoteRequest, VoteResponse,
};
use super::{ApplyMsg, RaftConfig, RaftStatus, Role};
use crate::error::{Error, Result};
use chrono::Utc;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cap on entries shipped in one AppendEntries call.
const MAX_APPEND_BATCH: usize = 64;

/// Everything the node reacts to.
pub(crate) enum RaftEvent {
    Vote(VoteRequest, oneshot::Sender<VoteResponse>),
    Append(AppendRequest, oneshot::Sender<AppendResponse>),
    Snapshot(SnapshotRequest, oneshot::Sender<SnapshotResponse>),
    TimeoutNow(TimeoutNowRequest),
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<Result<u64>>,
    },
    SetPeers(Vec<String>),
    TakeSnapshot {
        last_index: u64,
        data: serde_json::Value,
    },
    Transfer(oneshot::Sender<Result<()>>),
    /// Stop the node loop; used for tests and orderly replica shutdown.
    Shutdown,
    VoteResult {
        peer: String,
        resp: Option<VoteResponse>,
        term_at_send: u64,
    },
    AppendResult {
        peer: String,
        resp: Option<AppendResponse>,
        sent_up_to: u64,
        term_at_send: u64,
    },
    SnapshotResult {
        peer: String,
        resp: Option<SnapshotResponse>,
        last_index: u64,
        term_at_send: u64,
    },
}

pub(crate) struct RaftNode {
    config: RaftConfig,
    my_addr: String,
    peers: Vec<String>,
    clients: HashMap<String, PeerClient>,

    // Persistent state (mirrored to storage on every change).
    term: u64,
    voted_for: Option<String>,
    log: RaftLog,
    snapshot: Option<PersistedSnapshot>,

    // Volatile state.
    role: Role,
    leader_hint: Option<String>,
    commit_index: u64,
    last_delivered: u64,
    votes: HashSet<String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    in_flight: HashSet<String>,
    pending: BTreeMap<u64, oneshot::Sender<Result<u64>>>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,

    storage: RaftStorage,
    events_tx: mpsc::Sender<RaftEvent>,
    events_rx: mpsc::Receiver<RaftEvent>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    status_tx: watch::Sender<RaftStatus>,
}

impl RaftNode {
    pub(crate) async fn new(
        config: RaftConfig,
        events_tx: mpsc::Sender<RaftEvent>,
        events_rx: mpsc::Receiver<RaftEvent>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        status_tx: watch::Sender<RaftStatus>,
    ) -> Result<Self> {
        let storage = RaftStorage::open(&config.data_dir, config.clean_start).await?;
        let loaded = storage.load().await?;

        let (snapshot_index, snapshot_term) = loaded
            .snapshot
            .as_ref()
            .map(|s| (s.last_index, s.last_term))
            .unwrap_or((0, 0));
        let log = RaftLog::restore(snapshot_index, snapshot_term, loaded.entries);

        let my_addr = config.my_addr.clone();
        let peers = config.peers.clone();
        let now = Instant::now();
        let mut node = Self {
            my_addr,
            peers,
            clients: HashMap::new(),
            term: loaded.hard_state.term,
            voted_for: loaded.hard_state.voted_for,
            log,
            snapshot: loaded.snapshot,
            role: Role::Follower,
            leader_hint: None,
            commit_index: snapshot_index,
            last_delivered: snapshot_index,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            in_flight: HashSet::new(),
            pending: BTreeMap::new(),
            election_deadline: now,
            heartbeat_deadline: now,
            storage,
            events_tx,
            events_rx,
            apply_tx,
            status_tx,
            config,
        };
        node.reset_election_deadline();
        Ok(node)
    }

    pub(crate) async fn run(mut self) {
        // A restored snapshot is the apply loop's starting point.
        if let Some(snapshot) = self.snapshot.clone() {
            let _ = self
                .apply_tx
                .send(ApplyMsg::Snapshot {
                    index: snapshot.last_index,
                    data: snapshot.data,
                })
                .await;
        }
        info!(me = %self.my_addr, peers = self.peers.len(), "replication node starting");

        loop {
            self.publish_status();
            let deadline = if self.role == Role::Leader {
                self.heartbeat_deadline
            } else {
                self.election_deadline
            };
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(RaftEvent::Shutdown) | None => break,
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            error!(%err, "replication event failed");
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(err) = self.on_deadline().await {
                        error!(%err, "replication timer failed");
                    }
                }
            }
        }
        debug!(me = %self.my_addr, "replication node stopping");
    }

    async fn handle_event(&mut self, event: RaftEvent) -> Result<()> {
        match event {
            RaftEvent::Vote(req, reply) => {
                let resp = self.handle_vote(req).await?;
                let _ = reply.send(resp);
            }
            RaftEvent::Append(req, reply) => {
                let resp = self.handle_append(req).await?;
                let _ = reply.send(resp);
            }
            RaftEvent::Snapshot(req, reply) => {
                let resp = self.handle_install_snapshot(req).await?;
                let _ = reply.send(resp);
            }
            RaftEvent::TimeoutNow(req) => {
                if req.term >= self.term && self.role != Role::Leader {
                    info!(from = %req.leader, "leadership transfer: starting election now");
                    self.start_election().await?;
                }
            }
            RaftEvent::Propose { payload, reply } => self.handle_propose(payload, reply).await?,
            RaftEvent::SetPeers(peers) => self.set_peers(peers),
            RaftEvent::TakeSnapshot { last_index, data } => {
                self.take_snapshot(last_index, data).await?
            }
            RaftEvent::Transfer(reply) => {
                let _ = reply.send(self.transfer_leadership());
            }
            // Shutdown is intercepted by the run loop before dispatch.
            RaftEvent::Shutdown => {}
            RaftEvent::VoteResult {
                peer,
                resp,
                term_at_send,
            } => self.on_vote_result(peer, resp, term_at_send).await?,
            RaftEvent::AppendResult {
                peer,
                resp,
                sent_up_to,
                term_at_send,
            } => {
                self.on_append_result(peer, resp, sent_up_to, term_at_send)
                    .await?
            }
            RaftEvent::SnapshotResult {
                peer,
                resp,
                last_index,
                term_at_send,
            } => {
                self.on_snapshot_result(peer, resp, last_index, term_at_send)
                    .await?
            }
        }
        Ok(())
    }

    // ---- timers ----

    async fn on_deadline(&mut self) -> Result<()> {
        match self.role {
            Role::Leader => {
                self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
                self.broadcast_append();
                Ok(())
            }
            Role::Follower | Role::Candidate => self.start_election().await,
        }
    }

    fn reset_election_deadline(&mut self) {
        let jitter_ms = self.config.election_timeout_jitter.as_millis().max(1) as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
        self.election_deadline = Instant::now() + self.config.election_timeout_base + jitter;
    }

    // ---- elections ----

    async fn start_election(&mut self) -> Result<()> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.my_addr.clone());
        self.leader_hint = None;
        self.votes = HashSet::from([self.my_addr.clone()]);
        self.persist_hard_state().await?;
        self.reset_election_deadline();
        info!(term = self.term, "election started");

        if self.votes.len() >= self.quorum() {
            return self.become_leader().await;
        }

        let req = VoteRequest {
            term: self.term,
            candidate: self.my_addr.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.other_peers() {
            let client = self.client(&peer);
            let events = self.events_tx.clone();
            let req = req.clone();
            let term_at_send = self.term;
            tokio::spawn(async move {
                let resp = client.request_vote(&req).await.ok();
                let _ = events
                    .send(RaftEvent::VoteResult {
                        peer,
                        resp,
                        term_at_send,
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn on_vote_result(
        &mut self,
        peer: String,
        resp: Option<VoteResponse>,
        term_at_send: u64,
    ) -> Result<()> {
        let Some(resp) = resp else { return Ok(()) };
        if resp.term > self.term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Candidate || term_at_send != self.term || !resp.granted {
            return Ok(());
        }
        self.votes.insert(peer);
        if self.votes.len() >= self.quorum() {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<()> {
        info!(term = self.term, "elected leader");
        self.role = Role::Leader;
        self.leader_hint = Some(self.my_addr.clone());
        self.in_flight.clear();
        let next = self.log.last_index() + 1;
        for peer in self.other_peers() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }

        // Barrier entry: committing it commits everything from prior terms.
        let entry = LogEntry {
            term: self.term,
            index: self.log.last_index() + 1,
            payload: EntryPayload::Noop,
        };
        self.log.append(entry.clone());
        self.storage.append_entry(&entry).await?;
        self.advance_commit().await?;

        self.heartbeat_deadline = Instant::now();
        self.broadcast_append();
        Ok(())
    }

    async fn step_down(&mut self, new_term: u64) -> Result<()> {
        if new_term > self.term {
            self.term = new_term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        if self.role == Role::Leader {
            warn!(term = self.term, "stepping down from leadership");
        }
        self.role = Role::Follower;
        self.fail_pending("leadership lost before commit");
        self.reset_election_deadline();
        Ok(())
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, waiter) in std::mem::take(&mut self.pending) {
            let _ = waiter.send(Err(Error::Replication(reason.to_string())));
        }
    }

    fn transfer_leadership(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Err(Error::NotLeader(self.leader_hint.clone()));
        }
        let target = self
            .other_peers()
            .into_iter()
            .max_by_key(|p| self.match_index.get(p).copied().unwrap_or(0));
        let Some(target) = target else {
            return Err(Error::Replication("no peer to transfer leadership to".into()));
        };
        info!(%target, "transferring leadership");
        let client = self.client(&target);
        let req = TimeoutNowRequest {
            term: self.term,
            leader: self.my_addr.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = client.timeout_now(&req).await {
                warn!(%err, "leadership transfer request failed");
            }
        });
        Ok(())
    }

    // ---- inbound RPCs ----

    async fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        if req.term < self.term {
            return Ok(VoteResponse {
                term: self.term,
                granted: false,
            });
        }
        if req.term > self.term {
            self.step_down(req.term).await?;
        }

        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let can_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate,
        };
        let granted = up_to_date && can_vote;
        if granted {
            self.voted_for = Some(req.candidate.clone());
            self.persist_hard_state().await?;
            self.reset_election_deadline();
            debug!(candidate = %req.candidate, term = self.term, "vote granted");
        }
        Ok(VoteResponse {
            term: self.term,
            granted,
        })
    }

    async fn handle_append(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        if req.term < self.term {
            return Ok(AppendResponse {
                term: self.term,
                success: false,
                match_index: 0,
            });
        }
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.fail_pending("leadership lost before commit");
        }
        self.leader_hint = Some(req.leader.clone());
        self.reset_election_deadline();
        self.status_tx.send_if_modified(|s| {
            s.last_leader_contact = Utc::now();
            false
        });

        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            // The commit index is a safe backtracking hint: everything at or
            // below it matches the leader's log by definition.
            return Ok(AppendResponse {
                term: self.term,
                success: false,
                match_index: self.commit_index,
            });
        }

        let mut rewrite = false;
        let mut fresh = Vec::new();
        for entry in &req.entries {
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    self.log.truncate_from(entry.index);
                    self.log.append(entry.clone());
                    rewrite = true;
                }
                None => {
                    self.log.append(entry.clone());
                    if !rewrite {
                        fresh.push(entry.clone());
                    }
                }
            }
        }
        if rewrite {
            self.storage.rewrite_log(&self.log.all_entries()).await?;
        } else {
            for entry in &fresh {
                self.storage.append_entry(entry).await?;
            }
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        let new_commit = req.leader_commit.min(self.log.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.deliver_committed().await;
        }

        Ok(AppendResponse {
            term: self.term,
            success: true,
            match_index,
        })
    }

    async fn handle_install_snapshot(&mut self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        if req.term < self.term {
            return Ok(SnapshotResponse { term: self.term });
        }
        if req.term > self.term {
            self.term = req.term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        self.role = Role::Follower;
        self.leader_hint = Some(req.leader.clone());
        self.reset_election_deadline();

        if req.last_index <= self.commit_index {
            return Ok(SnapshotResponse { term: self.term });
        }

        info!(last_index = req.last_index, "installing snapshot from leader");
        let snapshot = PersistedSnapshot {
            last_index: req.last_index,
            last_term: req.last_term,
            data: req.data.clone(),
        };
        self.log.reset_to_snapshot(req.last_index, req.last_term);
        self.storage.save_snapshot(&snapshot).await?;
        self.storage.rewrite_log(&[]).await?;
        self.snapshot = Some(snapshot);
        self.commit_index = req.last_index;
        self.last_delivered = req.last_index;
        let _ = self
            .apply_tx
            .send(ApplyMsg::Snapshot {
                index: req.last_index,
                data: req.data,
            })
            .await;

        Ok(SnapshotResponse { term: self.term })
    }

    // ---- proposals and replication ----

    async fn handle_propose(
        &mut self,
        payload: EntryPayload,
        reply: oneshot::Sender<Result<u64>>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(Error::NotLeader(self.leader_hint.clone())));
            return Ok(());
        }
        let entry = LogEntry {
            term: self.term,
            index: self.log.last_index() + 1,
            payload,
        };
        self.log.append(entry.clone());
        self.storage.append_entry(&entry).await?;
        self.pending.insert(entry.index, reply);
        debug!(index = entry.index, term = entry.term, "proposal appended");

        self.advance_commit().await?;
        self.broadcast_append();
        Ok(())
    }

    fn broadcast_append(&mut self) {
        for peer in self.other_peers() {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &str) {
        if self.in_flight.contains(peer) {
            return;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);
        if next <= self.log.snapshot_index() {
            self.send_snapshot(peer);
            return;
        }
        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            self.send_snapshot(peer);
            return;
        };
        let entries = self.log.entries_from(next, MAX_APPEND_BATCH);
        let sent_up_to = prev_log_index + entries.len() as u64;
        let req = AppendRequest {
            term: self.term,
            leader: self.my_addr.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        self.in_flight.insert(peer.to_string());
        let client = self.client(peer);
        let events = self.events_tx.clone();
        let peer = peer.to_string();
        let term_at_send = self.term;
        tokio::spawn(async move {
            let resp = client.append_entries(&req).await.ok();
            let _ = events
                .send(RaftEvent::AppendResult {
                    peer,
                    resp,
                    sent_up_to,
                    term_at_send,
                })
                .await;
        });
    }

    fn send_snapshot(&mut self, peer: &str) {
        let Some(snapshot) = self.snapshot.clone() else {
            warn!(%peer, "peer needs a snapshot but none exists");
            return;
        };
        if self.in_flight.contains(peer) {
            return;
        }
        self.in_flight.insert(peer.to_string());
        let req = SnapshotRequest {
            term: self.term,
            leader: self.my_addr.clone(),
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            data: snapshot.data,
        };
        let client = self.client(peer);
        let events = self.events_tx.clone();
        let peer = peer.to_string();
        let term_at_send = self.term;
        let last_index = req.last_index;
        tokio::spawn(async move {
            let resp = client.install_snapshot(&req).await.ok();
            let _ = events
                .send(RaftEvent::SnapshotResult {
                    peer,
                    resp,
                    last_index,
                    term_at_send,
                })
                .await;
        });
    }

    async fn on_append_result(
        &mut self,
        peer: String,
        resp: Option<AppendResponse>,
        sent_up_to: u64,
        term_at_send: u64,
    ) -> Result<()> {
        self.in_flight.remove(&peer);
        let Some(resp) = resp else { return Ok(()) };
        if resp.term > self.term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Leader || term_at_send != self.term {
            return Ok(());
        }

        if resp.success {
            let matched = self.match_index.entry(peer.clone()).or_insert(0);
            *matched = (*matched).max(sent_up_to);
            self.next_index.insert(peer.clone(), sent_up_to + 1);
            self.advance_commit().await?;
            if sent_up_to < self.log.last_index() {
                self.send_append(&peer);
            }
        } else {
            // Back off to the follower's hint and retry immediately.
            let next = self.next_index.entry(peer.clone()).or_insert(1);
            *next = (resp.match_index + 1).min((*next).saturating_sub(1)).max(1);
            self.send_append(&peer);
        }
        Ok(())
    }

    async fn on_snapshot_result(
        &mut self,
        peer: String,
        resp: Option<SnapshotResponse>,
        last_index: u64,
        term_at_send: u64,
    ) -> Result<()> {
        self.in_flight.remove(&peer);
        let Some(resp) = resp else { return Ok(()) };
        if resp.term > self.term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Leader || term_at_send != self.term {
            return Ok(());
        }
        self.next_index.insert(peer.clone(), last_index + 1);
        self.match_index
            .entry(peer.clone())
            .and_modify(|m| *m = (*m).max(last_index))
            .or_insert(last_index);
        self.advance_commit().await?;
        if last_index < self.log.last_index() {
            self.send_append(&peer);
        }
        Ok(())
    }

    async fn advance_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let mut new_commit = self.commit_index;
        for index in (self.commit_index + 1)..=self.log.last_index() {
            // Only entries from the current term commit by counting.
            if self.log.term_at(index) != Some(self.term) {
                continue;
            }
            let replicas = 1 + self
                .other_peers()
                .iter()
                .filter(|p| self.match_index.get(*p).copied().unwrap_or(0) >= index)
                .count();
            if replicas >= self.quorum() {
                new_commit = index;
            }
        }
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.deliver_committed().await;
        }
        Ok(())
    }

    async fn deliver_committed(&mut self) {
        while self.last_delivered < self.commit_index {
            let index = self.last_delivered + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                break;
            };
            if let EntryPayload::Command(command) = entry.payload {
                if self
                    .apply_tx
                    .send(ApplyMsg::Command { index, command })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if let Some(waiter) = self.pending.remove(&index) {
                let _ = waiter.send(Ok(index));
            }
            self.last_delivered = index;
        }
    }

    // ---- snapshots and membership ----

    async fn take_snapshot(&mut self, last_index: u64, data: serde_json::Value) -> Result<()> {
        if last_index <= self.log.snapshot_index() {
            return Ok(());
        }
        if last_index > self.last_delivered {
            warn!(
                last_index,
                delivered = self.last_delivered,
                "refusing snapshot ahead of the applied state"
            );
            return Ok(());
        }
        let Some(term) = self.log.term_at(last_index) else {
            return Ok(());
        };
        let snapshot = PersistedSnapshot {
            last_index,
            last_term: term,
            data,
        };
        self.log.compact_to(last_index, term);
        self.storage.save_snapshot(&snapshot).await?;
        self.storage.rewrite_log(&self.log.all_entries()).await?;
        self.snapshot = Some(snapshot);
        info!(last_index, "log compacted into snapshot");
        Ok(())
    }

    fn set_peers(&mut self, mut peers: Vec<String>) {
        if !peers.contains(&self.my_addr) {
            warn!(me = %self.my_addr, "membership update omits this replica; keeping self");
            peers.push(self.my_addr.clone());
        }
        peers.sort();
        peers.dedup();
        let next = self.log.last_index() + 1;
        for peer in &peers {
            if peer != &self.my_addr && !self.next_index.contains_key(peer) {
                self.next_index.insert(peer.clone(), next);
                self.match_index.insert(peer.clone(), 0);
            }
        }
        self.clients.retain(|addr, _| peers.contains(addr));
        info!(replicas = peers.len(), "replication membership updated");
        self.peers = peers;
    }

    // ---- helpers ----

    fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn other_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| **p != self.my_addr)
            .cloned()
            .collect()
    }

    fn client(&mut self, peer: &str) -> PeerClient {
        self.clients
            .entry(peer.to_string())
            .or_insert_with(|| PeerClient::new(peer))
            .clone()
    }

    async fn persist_hard_state(&self) -> Result<()> {
        self.storage
            .save_hard_state(&HardState {
                term: self.term,
                voted_for: self.voted_for.clone(),
            })
            .await
    }

    fn publish_status(&self) {
        self.status_tx.send_if_modified(|status| {
            let changed = status.role != self.role
                || status.term != self.term
                || status.leader_hint != self.leader_hint;
            if changed {
                status.role = self.role;
                status.term = self.term;
                status.leader_hint = self.leader_hint.clone();
            }
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn node_with_peers(dir: &TempDir, peers: &[&str]) -> (RaftNode, mpsc::Receiver<ApplyMsg>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (apply_tx, apply_rx) = mpsc::channel(64);
        let (status_tx, _status_rx) = watch::channel(RaftStatus::default());
        let config = RaftConfig::new(
            peers[0].to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            dir.path().join("raft"),
        );
        let node = RaftNode::new(config, events_tx, events_rx, apply_tx, status_tx)
            .await
            .unwrap();
        (node, apply_rx)
    }

    fn command_entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Command(serde_json::json!({"op": "complete-map", "id": 0})),
        }
    }

    #[tokio::test]
    async fn grants_vote_once_per_term() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) =
            node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;

        let req = VoteRequest {
            term: 1,
            candidate: "b:1".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(node.handle_vote(req.clone()).await.unwrap().granted);

        // Same term, different candidate: refused.
        let rival = VoteRequest {
            candidate: "c:1".into(),
            ..req.clone()
        };
        assert!(!node.handle_vote(rival).await.unwrap().granted);

        // Same candidate again: still granted (idempotent).
        assert!(node.handle_vote(req).await.unwrap().granted);
    }

    #[tokio::test]
    async fn rejects_vote_for_stale_log() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;
        node.log.append(command_entry(1, 1));
        node.term = 1;

        let behind = VoteRequest {
            term: 2,
            candidate: "b:1".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(!node.handle_vote(behind).await.unwrap().granted);

        let caught_up = VoteRequest {
            term: 2,
            candidate: "c:1".into(),
            last_log_index: 1,
            last_log_term: 1,
        };
        assert!(node.handle_vote(caught_up).await.unwrap().granted);
    }

    #[tokio::test]
    async fn append_rejects_stale_term_and_bad_prev() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;
        node.term = 5;

        let stale = AppendRequest {
            term: 4,
            leader: "b:1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        assert!(!node.handle_append(stale).await.unwrap().success);

        let gap = AppendRequest {
            term: 5,
            leader: "b:1".into(),
            prev_log_index: 3,
            prev_log_term: 5,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = node.handle_append(gap).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.match_index, 0);
    }

    #[tokio::test]
    async fn append_applies_committed_entries() {
        let dir = TempDir::new().unwrap();
        let (mut node, mut apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;

        let req = AppendRequest {
            term: 1,
            leader: "b:1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![command_entry(1, 1), command_entry(1, 2)],
            leader_commit: 2,
        };
        let resp = node.handle_append(req).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(node.commit_index, 2);

        for expected in 1..=2 {
            match apply.recv().await.unwrap() {
                ApplyMsg::Command { index, .. } => assert_eq!(index, expected),
                other => panic!("unexpected apply message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn append_truncates_conflicting_suffix() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;
        node.term = 2;
        node.log.append(command_entry(1, 1));
        node.log.append(command_entry(1, 2));

        let req = AppendRequest {
            term: 2,
            leader: "b:1".into(),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![command_entry(2, 2), command_entry(2, 3)],
            leader_commit: 0,
        };
        let resp = node.handle_append(req).await.unwrap();
        assert!(resp.success);
        assert_eq!(node.log.last_index(), 3);
        assert_eq!(node.log.term_at(2), Some(2));
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let dir = TempDir::new().unwrap();
        let (mut node, mut apply) = node_with_peers(&dir, &["a:1"]).await;

        node.start_election().await.unwrap();
        assert_eq!(node.role, Role::Leader);

        let (tx, rx) = oneshot::channel();
        node.handle_propose(
            EntryPayload::Command(serde_json::json!({"op": "complete-map", "id": 2})),
            tx,
        )
        .await
        .unwrap();
        let index = rx.await.unwrap().unwrap();
        // Index 1 is the leader's noop barrier.
        assert_eq!(index, 2);

        match apply.recv().await.unwrap() {
            ApplyMsg::Command { index, command } => {
                assert_eq!(index, 2);
                assert_eq!(command["id"], 2);
            }
            other => panic!("unexpected apply message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn proposals_on_followers_are_refused_with_hint() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;
        node.leader_hint = Some("b:1".into());

        let (tx, rx) = oneshot::channel();
        node.handle_propose(EntryPayload::Noop, tx).await.unwrap();
        match rx.await.unwrap() {
            Err(Error::NotLeader(hint)) => assert_eq!(hint.as_deref(), Some("b:1")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quorum_append_results_advance_commit() {
        let dir = TempDir::new().unwrap();
        let (mut node, mut apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;

        node.start_election().await.unwrap();
        node.on_vote_result("b:1".into(), Some(VoteResponse { term: 1, granted: true }), 1)
            .await
            .unwrap();
        assert_eq!(node.role, Role::Leader);

        let (tx, _rx) = oneshot::channel();
        node.handle_propose(
            EntryPayload::Command(serde_json::json!({"op": "complete-map", "id": 7})),
            tx,
        )
        .await
        .unwrap();
        assert_eq!(node.commit_index, 0);

        // One follower acking both entries forms a quorum of 2/3.
        node.on_append_result(
            "b:1".into(),
            Some(AppendResponse {
                term: 1,
                success: true,
                match_index: 2,
            }),
            2,
            1,
        )
        .await
        .unwrap();
        assert_eq!(node.commit_index, 2);

        match apply.recv().await.unwrap() {
            ApplyMsg::Command { command, .. } => assert_eq!(command["id"], 7),
            other => panic!("unexpected apply message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn taking_a_snapshot_compacts_the_log() {
        let dir = TempDir::new().unwrap();
        let (mut node, mut apply) = node_with_peers(&dir, &["a:1"]).await;

        node.start_election().await.unwrap();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            node.handle_propose(
                EntryPayload::Command(serde_json::json!({"op": "complete-map", "id": 0})),
                tx,
            )
            .await
            .unwrap();
            rx.await.unwrap().unwrap();
            apply.recv().await.unwrap();
        }
        let last = node.log.last_index();

        node.take_snapshot(last, serde_json::json!({"phase": "reduce"}))
            .await
            .unwrap();
        assert_eq!(node.log.snapshot_index(), last);
        assert!(node.log.is_empty());
        assert_eq!(node.snapshot.as_ref().unwrap().last_index, last);

        // Snapshots ahead of the applied frontier are refused.
        node.take_snapshot(last + 10, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(node.log.snapshot_index(), last);
    }

    #[tokio::test]
    async fn membership_updates_change_the_quorum() {
        let dir = TempDir::new().unwrap();
        let (mut node, _apply) = node_with_peers(&dir, &["a:1"]).await;
        assert_eq!(node.quorum(), 1);

        node.set_peers(vec!["a:1".into(), "b:1".into(), "c:1".into()]);
        assert_eq!(node.quorum(), 2);
        assert!(node.next_index.contains_key("b:1"));

        // An update that forgets this replica keeps it anyway.
        node.set_peers(vec!["b:1".into()]);
        assert!(node.peers.contains(&"a:1".to_string()));
    }

    #[tokio::test]
    async fn installed_snapshot_resets_follower_state() {
        let dir = TempDir::new().unwrap();
        let (mut node, mut apply) = node_with_peers(&dir, &["a:1", "b:1", "c:1"]).await;

        let req = SnapshotRequest {
            term: 3,
            leader: "b:1".into(),
            last_index: 10,
            last_term: 3,
            data: serde_json::json!({"phase": "reduce"}),
        };
        node.handle_install_snapshot(req).await.unwrap();
        assert_eq!(node.commit_index, 10);
        assert_eq!(node.log.last_index(), 10);

        match apply.recv().await.unwrap() {
            ApplyMsg::Snapshot { index, data } => {
                assert_eq!(index, 10);
                assert_eq!(data["phase"], "reduce");
            }
            other => panic!("unexpected apply message: {other:?}"),
        }
    }
}
