//! Worker-facing RPC surface: one axum route per RPC.
//!
//! Leader-only calls answer through the `RpcResponse` envelope so a worker
//! can tell "redirect" from "retry" from "give up". Read-only introspection
//! (`master-info`, worker listings) is served by any replica from its own
//! view, which may be stale on followers; that is fine for dashboards and
//! discovery but never used for assignment.

pub mod client;
pub mod types;

use crate::master::Master;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use types::{
    Ack, AddMasterRequest, AssignRequest, CompleteRequest, HeartbeatRequest, MasterInfo,
    RemoveMasterRequest, ResetRequest, RpcResponse, TaskAssignment, WorkerCount, WorkerInfo,
};

/// Build the worker-facing router for one replica.
pub fn router(master: Arc<Master>) -> Router {
    Router::new()
        .route("/mr/master-info", get(master_info))
        .route("/mr/assign", post(assign_task))
        .route("/mr/complete", post(task_completed))
        .route("/mr/heartbeat", post(worker_heartbeat))
        .route("/mr/reset", post(reset_task))
        .route("/mr/workers", get(worker_info))
        .route("/mr/workers/count", get(worker_count))
        .route("/mr/worker-tasks", get(worker_tasks))
        .route("/mr/transfer-leadership", post(transfer_leadership))
        .route("/mr/membership", get(membership))
        .route("/mr/admin/add-master", post(add_master))
        .route("/mr/admin/remove-master", post(remove_master))
        .with_state(master)
}

async fn master_info(State(master): State<Arc<Master>>) -> Json<MasterInfo> {
    Json(master.master_info().await)
}

async fn assign_task(
    State(master): State<Arc<Master>>,
    Json(req): Json<AssignRequest>,
) -> Json<RpcResponse<TaskAssignment>> {
    Json(master.assign_task(&req.worker_id).await.into())
}

async fn task_completed(
    State(master): State<Arc<Master>>,
    Json(req): Json<CompleteRequest>,
) -> Json<RpcResponse<Ack>> {
    Json(
        master
            .task_completed(req.kind, req.task_id, &req.worker_id)
            .await
            .map(|()| Ack {})
            .into(),
    )
}

async fn worker_heartbeat(
    State(master): State<Arc<Master>>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<RpcResponse<Ack>> {
    Json(master.heartbeat(&req.worker_id).await.map(|()| Ack {}).into())
}

/// Manual reset. Followers forward to the current leader and relay the
/// result instead of bouncing the operator around.
async fn reset_task(
    State(master): State<Arc<Master>>,
    Json(req): Json<ResetRequest>,
) -> Json<RpcResponse<Ack>> {
    if master.is_leader() {
        return Json(
            master
                .reset_task(req.task_id, req.kind, &req.reason)
                .await
                .map(|()| Ack {})
                .into(),
        );
    }
    let Some(leader_addr) = master.leader_rpc_hint().await else {
        return Json(RpcResponse::NotLeader { leader_hint: None });
    };
    info!(leader = %leader_addr, "forwarding reset to leader");
    match client::MasterClient::new(&leader_addr)
        .reset_task(req.task_id, req.kind, &req.reason)
        .await
    {
        Ok(response) => Json(response),
        Err(err) => Json(RpcResponse::from_error(&err)),
    }
}

async fn worker_info(State(master): State<Arc<Master>>) -> Json<Vec<WorkerInfo>> {
    Json(master.worker_infos().await)
}

async fn worker_count(State(master): State<Arc<Master>>) -> Json<WorkerCount> {
    Json(WorkerCount {
        count: master.worker_count().await,
    })
}

#[derive(Debug, Deserialize)]
struct WorkerTasksQuery {
    worker_id: String,
}

async fn worker_tasks(
    State(master): State<Arc<Master>>,
    Query(query): Query<WorkerTasksQuery>,
) -> Json<Vec<types::TaskRef>> {
    Json(master.worker_tasks(&query.worker_id).await)
}

async fn transfer_leadership(State(master): State<Arc<Master>>) -> Json<RpcResponse<Ack>> {
    Json(
        master
            .transfer_leadership()
            .await
            .map(|()| Ack {})
            .into(),
    )
}

async fn membership(
    State(master): State<Arc<Master>>,
) -> Json<Vec<crate::state::ReplicaAddrs>> {
    Json(master.membership().await)
}

async fn add_master(
    State(master): State<Arc<Master>>,
    Json(req): Json<AddMasterRequest>,
) -> Json<RpcResponse<Ack>> {
    Json(
        master
            .add_master(req.replication_addr, req.rpc_addr)
            .await
            .map(|()| Ack {})
            .into(),
    )
}

async fn remove_master(
    State(master): State<Arc<Master>>,
    Json(req): Json<RemoveMasterRequest>,
) -> Json<RpcResponse<Ack>> {
    Json(
        master
            .remove_master(req.replication_addr)
            .await
            .map(|()| Ack {})
            .into(),
    )
}
