//! Replica-to-replica wire protocol: JSON over HTTP.
//!
//! The same message types serve both directions, so any replica can talk to
//! any other. Inbound requests are bridged onto the node's event channel and
//! answered with the node's reply; outbound requests go through `PeerClient`.

use super::log::LogEntry;
use super::node::RaftEvent;
use crate::error::{Error, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known replicated on the follower; doubles as the
    /// leader's backtracking hint on failure.
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader: String,
    pub last_index: u64,
    pub last_term: u64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub leader: String,
}

/// Build the replication-side router for one replica.
pub fn replication_router(events: mpsc::Sender<RaftEvent>) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/append", post(handle_append))
        .route("/raft/snapshot", post(handle_snapshot))
        .route("/raft/timeout-now", post(handle_timeout_now))
        .with_state(events)
}

async fn handle_vote(
    State(events): State<mpsc::Sender<RaftEvent>>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, StatusCode> {
    let (tx, rx) = oneshot::channel();
    events
        .send(RaftEvent::Vote(req, tx))
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn handle_append(
    State(events): State<mpsc::Sender<RaftEvent>>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, StatusCode> {
    let (tx, rx) = oneshot::channel();
    events
        .send(RaftEvent::Append(req, tx))
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn handle_snapshot(
    State(events): State<mpsc::Sender<RaftEvent>>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<SnapshotResponse>, StatusCode> {
    let (tx, rx) = oneshot::channel();
    events
        .send(RaftEvent::Snapshot(req, tx))
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn handle_timeout_now(
    State(events): State<mpsc::Sender<RaftEvent>>,
    Json(req): Json<TimeoutNowRequest>,
) -> StatusCode {
    match events.send(RaftEvent::TimeoutNow(req)).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Outbound client for one peer replica.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    base: String,
}

impl PeerClient {
    pub fn new(replication_addr: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: format!("http://{replication_addr}"),
        }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base, path);
        let response = self.http.post(&url).json(req).send().await?;
        if !response.status().is_success() {
            return Err(Error::Replication(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    pub async fn request_vote(&self, req: &VoteRequest) -> Result<VoteResponse> {
        self.post("/raft/vote", req).await
    }

    pub async fn append_entries(&self, req: &AppendRequest) -> Result<AppendResponse> {
        self.post("/raft/append", req).await
    }

    pub async fn install_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotResponse> {
        self.post("/raft/snapshot", req).await
    }

    pub async fn timeout_now(&self, req: &TimeoutNowRequest) -> Result<()> {
        let url = format!("{}/raft/timeout-now", self.base);
        let response = self.http.post(&url).json(req).send().await?;
        if !response.status().is_success() {
            return Err(Error::Replication(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
