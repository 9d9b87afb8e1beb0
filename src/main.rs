//! gristmill CLI entry point.
//!
//! Two subcommands: `master` runs one replica of the replicated master,
//! `worker` runs a task-executing worker against the master group. Flags
//! override the optional JSON config file; `GRISTMILL_*` environment
//! variables back most flags.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gristmill::config::{Config, WorkerConfig};
use gristmill::job::{word_count_map, word_count_reduce};
use gristmill::master::Master;
use gristmill::worker::Worker;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "gristmill", version, about = "Fault-tolerant distributed MapReduce")]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one master replica
    Master(MasterArgs),
    /// Run a worker process
    Worker(WorkerArgs),
    /// Print cluster and worker status
    Status(StatusArgs),
}

#[derive(Args)]
struct MasterArgs {
    /// JSON config file; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated replication endpoints for all replicas
    #[arg(long, env = "GRISTMILL_REPLICATION_ADDRESSES", value_delimiter = ',')]
    replication_addresses: Vec<String>,

    /// Comma-separated RPC endpoints, index-aligned with the replication list
    #[arg(long, env = "GRISTMILL_RPC_ADDRESSES", value_delimiter = ',')]
    rpc_addresses: Vec<String>,

    /// This replica's index into the address lists
    #[arg(long, env = "GRISTMILL_MY_ID")]
    my_id: Option<usize>,

    /// Reducer fan-out hint
    #[arg(long, env = "GRISTMILL_WORKER_COUNT")]
    worker_count: Option<u32>,

    /// Input shard files, one per map task
    #[arg(long, env = "GRISTMILL_INPUTS", value_delimiter = ',')]
    inputs: Vec<PathBuf>,

    /// Base path for intermediate files
    #[arg(long, env = "GRISTMILL_TMP_PATH")]
    tmp_path: Option<PathBuf>,

    /// Base path for final outputs
    #[arg(long, env = "GRISTMILL_OUTPUT_PATH")]
    output_path: Option<PathBuf>,

    /// Replication log data directory
    #[arg(long, env = "GRISTMILL_DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Wipe the replication data directory on boot
    #[arg(long, env = "GRISTMILL_CLEAN_START")]
    clean_start: bool,

    /// Task execution timeout (e.g. "15s")
    #[arg(long, value_parser = humantime::parse_duration)]
    task_timeout: Option<Duration>,

    /// Worker silence threshold (e.g. "30s")
    #[arg(long, value_parser = humantime::parse_duration)]
    worker_timeout: Option<Duration>,

    /// Expected worker heartbeat interval (e.g. "10s")
    #[arg(long, value_parser = humantime::parse_duration)]
    heartbeat_interval: Option<Duration>,
}

#[derive(Args)]
struct StatusArgs {
    /// Comma-separated RPC endpoints of the master replicas
    #[arg(long, env = "GRISTMILL_RPC_ADDRESSES", value_delimiter = ',')]
    rpc_addresses: Vec<String>,
}

#[derive(Args)]
struct WorkerArgs {
    /// Comma-separated RPC endpoints of the master replicas
    #[arg(long, env = "GRISTMILL_RPC_ADDRESSES", value_delimiter = ',')]
    rpc_addresses: Vec<String>,

    /// Base path for intermediate files (shared with the masters)
    #[arg(long, env = "GRISTMILL_TMP_PATH")]
    tmp_path: Option<PathBuf>,

    /// Base path for final outputs
    #[arg(long, env = "GRISTMILL_OUTPUT_PATH")]
    output_path: Option<PathBuf>,

    /// Heartbeat interval (e.g. "10s")
    #[arg(long, value_parser = humantime::parse_duration)]
    heartbeat_interval: Option<Duration>,
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "gristmill=debug,info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(verbose >= 2)
        .init();
}

fn build_master_config(args: MasterArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config {
            replication_addresses: Vec::new(),
            rpc_addresses: Vec::new(),
            my_id: 0,
            worker_count: gristmill::config::DEFAULT_WORKER_COUNT,
            inputs: Vec::new(),
            tmp_path: PathBuf::from("mr-data"),
            output_path: PathBuf::from("mr-data"),
            data_path: PathBuf::from("raft-data"),
            clean_start: false,
            task_timeout: gristmill::config::DEFAULT_TASK_TIMEOUT,
            worker_timeout: gristmill::config::DEFAULT_WORKER_TIMEOUT,
            heartbeat_interval: gristmill::config::DEFAULT_HEARTBEAT_INTERVAL,
        },
    };

    if !args.replication_addresses.is_empty() {
        config.replication_addresses = args.replication_addresses;
    }
    if !args.rpc_addresses.is_empty() {
        config.rpc_addresses = args.rpc_addresses;
    }
    if let Some(my_id) = args.my_id {
        config.my_id = my_id;
    }
    if let Some(worker_count) = args.worker_count {
        config.worker_count = worker_count;
    }
    if !args.inputs.is_empty() {
        config.inputs = args.inputs;
    }
    if let Some(tmp_path) = args.tmp_path {
        config.tmp_path = tmp_path;
    }
    if let Some(output_path) = args.output_path {
        config.output_path = output_path;
    }
    if let Some(data_path) = args.data_path {
        config.data_path = data_path;
    }
    if args.clean_start {
        config.clean_start = true;
    }
    if let Some(task_timeout) = args.task_timeout {
        config.task_timeout = task_timeout;
    }
    if let Some(worker_timeout) = args.worker_timeout {
        config.worker_timeout = worker_timeout;
    }
    if let Some(heartbeat_interval) = args.heartbeat_interval {
        config.heartbeat_interval = heartbeat_interval;
    }

    config.validate()?;
    Ok(config)
}

async fn run_master(args: MasterArgs) -> Result<()> {
    let config = build_master_config(args)?;
    let master = Master::start(config).await?;

    tokio::select! {
        result = master.serve() => result.context("master stopped unexpectedly")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    if args.rpc_addresses.is_empty() {
        anyhow::bail!("worker needs --rpc-addresses of the master replicas");
    }
    let config = WorkerConfig {
        rpc_addresses: args.rpc_addresses,
        tmp_path: args.tmp_path.unwrap_or_else(|| PathBuf::from("mr-data")),
        output_path: args.output_path.unwrap_or_else(|| PathBuf::from("mr-data")),
        heartbeat_interval: args
            .heartbeat_interval
            .unwrap_or(gristmill::config::DEFAULT_HEARTBEAT_INTERVAL),
    };
    let worker = Worker::new(config, word_count_map, word_count_reduce);

    tokio::select! {
        result = worker.run() => result.context("worker failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}

async fn run_status(args: StatusArgs) -> Result<()> {
    use gristmill::rpc::client::{ClusterClient, MasterClient};

    if args.rpc_addresses.is_empty() {
        anyhow::bail!("status needs --rpc-addresses of the master replicas");
    }

    for addr in &args.rpc_addresses {
        match MasterClient::new(addr).master_info().await {
            Ok(info) => println!(
                "{addr}: id={} state={:?} term={} leader={}",
                info.my_id,
                info.raft_state,
                info.term,
                info.leader_addr.as_deref().unwrap_or("?"),
            ),
            Err(err) => println!("{addr}: unreachable ({err})"),
        }
    }

    let cluster = ClusterClient::new(&args.rpc_addresses);
    let Some(leader) = cluster.find_leader().await else {
        println!("no reachable leader");
        return Ok(());
    };
    let workers = leader.list_workers().await?;
    println!("workers: {}", workers.len());
    for worker in workers {
        println!(
            "  {} status={:?} completed={} in-flight={}",
            worker.id,
            worker.status,
            worker.completed,
            worker.in_flight.len(),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Master(args) => run_master(args).await,
        Command::Worker(args) => run_worker(args).await,
        Command::Status(args) => run_status(args).await,
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
