//! Full-stack test over real HTTP: master replica serving axum listeners,
//! workers talking through the reqwest clients.

use gristmill::config::{Config, WorkerConfig};
use gristmill::job::{word_count_map, word_count_reduce};
use gristmill::master::Master;
use gristmill::rpc::client::{ClusterClient, MasterClient};
use gristmill::rpc::types::{RpcResponse, TaskAssignment};
use gristmill::state::{Phase, TaskKind};
use gristmill::worker::Worker;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn serve_single_replica(dir: &Path, inputs: Vec<std::path::PathBuf>) -> (Arc<Master>, String) {
    let rpc_addr = format!("127.0.0.1:{}", free_port());
    let config = Config {
        replication_addresses: vec![format!("127.0.0.1:{}", free_port())],
        rpc_addresses: vec![rpc_addr.clone()],
        my_id: 0,
        worker_count: 2,
        inputs,
        tmp_path: dir.join("data"),
        output_path: dir.join("data"),
        data_path: dir.join("raft"),
        clean_start: false,
        task_timeout: Duration::from_secs(15),
        worker_timeout: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(10),
    };
    let master = Master::start(config).await.unwrap();
    let server = master.clone();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    assert!(master.wait_until_serving(Duration::from_secs(10)).await);
    (master, rpc_addr)
}

fn write_shards(dir: &Path, contents: &[&str]) -> Vec<std::path::PathBuf> {
    contents
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let path = dir.join(format!("shard-{i}.txt"));
            std::fs::write(&path, text).unwrap();
            path
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn master_info_and_heartbeat_over_http() {
    let dir = TempDir::new().unwrap();
    let inputs = write_shards(dir.path(), &["a b", "c"]);
    let (master, rpc_addr) = serve_single_replica(dir.path(), inputs).await;

    let client = MasterClient::new(&rpc_addr);
    let info = client.master_info().await.unwrap();
    assert!(info.is_leader);
    assert_eq!(info.my_id, 0);
    assert_eq!(info.leader_addr.as_deref(), Some(rpc_addr.as_str()));

    let ack = client.heartbeat("hb-worker").await.unwrap();
    assert!(matches!(ack, RpcResponse::Ok { .. }));
    assert_eq!(master.worker_count().await, 1);

    let tasks = master.worker_tasks("hb-worker").await;
    assert!(tasks.is_empty());
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_with_missing_artifacts_is_rejected_over_http() {
    let dir = TempDir::new().unwrap();
    let inputs = write_shards(dir.path(), &["a b", "c"]);
    let (master, rpc_addr) = serve_single_replica(dir.path(), inputs).await;

    let client = MasterClient::new(&rpc_addr);
    let assignment = client.assign_task("liar").await.unwrap();
    assert!(matches!(
        assignment,
        RpcResponse::Ok {
            value: TaskAssignment::Map { .. }
        }
    ));

    // Claim completion without having written anything.
    let response = client.task_completed(0, TaskKind::Map, "liar").await.unwrap();
    match response {
        RpcResponse::Fatal { reason } => assert!(reason.contains("validation")),
        other => panic!("expected a fatal rejection, got {other:?}"),
    }
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_client_finds_the_leader() {
    let dir = TempDir::new().unwrap();
    let inputs = write_shards(dir.path(), &["a b", "c"]);
    let (master, rpc_addr) = serve_single_replica(dir.path(), inputs).await;

    // One dead address plus the live replica.
    let cluster = ClusterClient::new(&[format!("127.0.0.1:{}", free_port()), rpc_addr.clone()]);
    let leader = cluster.find_leader().await.expect("leader not found");
    assert_eq!(leader.addr(), rpc_addr);
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_grows_through_the_admin_surface() {
    let dir = TempDir::new().unwrap();
    let inputs = write_shards(dir.path(), &["a b", "c"]);
    let (master, rpc_addr) = serve_single_replica(dir.path(), inputs).await;
    let client = MasterClient::new(&rpc_addr);

    let members = client.membership().await.unwrap();
    assert_eq!(members.len(), 1);

    // The add commits under the old quorum of one, then the group is two.
    let response = client
        .add_master("127.0.0.1:7999", "127.0.0.1:8999")
        .await
        .unwrap();
    assert!(matches!(response, RpcResponse::Ok { .. }));

    let members = client.membership().await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|m| m.replication == "127.0.0.1:7999"));
    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_http_workers_finish_a_word_count() {
    let dir = TempDir::new().unwrap();
    let inputs = write_shards(dir.path(), &["a a b", "b c", "c c"]);
    let (master, rpc_addr) = serve_single_replica(dir.path(), inputs).await;

    let worker_config = WorkerConfig {
        rpc_addresses: vec![rpc_addr.clone()],
        tmp_path: dir.path().join("data"),
        output_path: dir.path().join("data"),
        heartbeat_interval: Duration::from_secs(10),
    };
    let mut handles = Vec::new();
    for i in 0..2 {
        // Identity is captured at construction, so set the env before
        // building each worker rather than inside the spawned task.
        std::env::set_var("GRISTMILL_WORKER_ID", format!("http-worker-{i}"));
        let worker = Worker::new(worker_config.clone(), word_count_map, word_count_reduce);
        handles.push(tokio::spawn(async move { worker.run().await }));
    }
    std::env::remove_var("GRISTMILL_WORKER_ID");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("worker timed out")
            .unwrap()
            .unwrap();
    }

    let state = master.job_state().await;
    assert_eq!(state.phase, Phase::Done);

    let store = gristmill::artifact::ArtifactStore::new(dir.path().join("data"), dir.path().join("data"));
    let mut union = std::collections::BTreeMap::new();
    for r in 0..2 {
        union.extend(gristmill::artifact::output::read_as_map(&store.output_path(r)).unwrap());
    }
    let expected: std::collections::BTreeMap<String, String> = [("a", "2"), ("b", "2"), ("c", "3")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(union, expected);
    master.shutdown().await;
}
