//! HTTP clients for the worker-facing RPC surface.
//!
//! `MasterClient` talks to one replica; `ClusterClient` knows every replica
//! and chases the leader across failovers.

use super::types::{
    Ack, AddMasterRequest, AssignRequest, CompleteRequest, HeartbeatRequest, MasterInfo,
    RemoveMasterRequest, ResetRequest, RpcResponse, TaskAssignment, WorkerInfo,
};
use crate::state::ReplicaAddrs;
use crate::error::Result;
use crate::state::TaskKind;
use futures::future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Client for a single master replica.
#[derive(Debug, Clone)]
pub struct MasterClient {
    http: reqwest::Client,
    base: String,
    addr: String,
}

impl MasterClient {
    pub fn new(rpc_addr: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: format!("http://{rpc_addr}"),
            addr: rpc_addr.to_string(),
        }
    }

    /// The replica address this client points at.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base, path);
        let response = self.http.post(&url).json(req).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn master_info(&self) -> Result<MasterInfo> {
        let url = format!("{}/mr/master-info", self.base);
        let response = self.http.get(&url).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn assign_task(&self, worker_id: &str) -> Result<RpcResponse<TaskAssignment>> {
        self.post(
            "/mr/assign",
            &AssignRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    pub async fn task_completed(
        &self,
        task_id: u32,
        kind: TaskKind,
        worker_id: &str,
    ) -> Result<RpcResponse<Ack>> {
        self.post(
            "/mr/complete",
            &CompleteRequest {
                task_id,
                kind,
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<RpcResponse<Ack>> {
        self.post(
            "/mr/heartbeat",
            &HeartbeatRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    pub async fn reset_task(
        &self,
        task_id: u32,
        kind: TaskKind,
        reason: &str,
    ) -> Result<RpcResponse<Ack>> {
        self.post(
            "/mr/reset",
            &ResetRequest {
                task_id,
                kind,
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn transfer_leadership(&self) -> Result<RpcResponse<Ack>> {
        self.post("/mr/transfer-leadership", &serde_json::json!({}))
            .await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let url = format!("{}/mr/workers", self.base);
        let response = self.http.get(&url).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn membership(&self) -> Result<Vec<ReplicaAddrs>> {
        let url = format!("{}/mr/membership", self.base);
        let response = self.http.get(&url).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn add_master(
        &self,
        replication_addr: &str,
        rpc_addr: &str,
    ) -> Result<RpcResponse<Ack>> {
        self.post(
            "/mr/admin/add-master",
            &AddMasterRequest {
                replication_addr: replication_addr.to_string(),
                rpc_addr: rpc_addr.to_string(),
            },
        )
        .await
    }

    pub async fn remove_master(&self, replication_addr: &str) -> Result<RpcResponse<Ack>> {
        self.post(
            "/mr/admin/remove-master",
            &RemoveMasterRequest {
                replication_addr: replication_addr.to_string(),
            },
        )
        .await
    }
}

/// Client that discovers and tracks the leader among all replicas.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    replicas: Vec<MasterClient>,
}

impl ClusterClient {
    pub fn new(rpc_addresses: &[String]) -> Self {
        Self {
            replicas: rpc_addresses.iter().map(|a| MasterClient::new(a)).collect(),
        }
    }

    /// Ask every replica who leads, concurrently. A replica claiming
    /// leadership wins; otherwise the first usable leader hint is followed.
    pub async fn find_leader(&self) -> Option<MasterClient> {
        let probes = self.replicas.iter().map(|r| async move {
            let info = r.master_info().await;
            (r, info)
        });
        let mut hint: Option<String> = None;
        for (replica, info) in future::join_all(probes).await {
            match info {
                Ok(info) if info.is_leader => {
                    debug!(leader = replica.addr(), "leader located");
                    return Some(replica.clone());
                }
                Ok(info) => {
                    if hint.is_none() {
                        hint = info.leader_addr;
                    }
                }
                Err(err) => debug!(replica = replica.addr(), %err, "replica unreachable"),
            }
        }
        let hint = hint?;
        self.replicas.iter().find(|r| r.addr() == hint).cloned()
    }
}
