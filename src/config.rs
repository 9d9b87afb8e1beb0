//! Replica and worker configuration.
//!
//! All options form one flat mapping. They can come from a JSON config file,
//! from `GRISTMILL_*` environment variables wired up by clap in `main`, or
//! from command-line flags; flags win over the file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default task execution timeout before the monitor resets the task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15);
/// Default silence threshold after which a worker is considered dead.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval at which workers send heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default reducer fan-out when no worker count hint is given.
pub const DEFAULT_WORKER_COUNT: u32 = 3;

/// Configuration for one master replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Replication endpoints for every replica, index-aligned with
    /// `rpc_addresses`.
    pub replication_addresses: Vec<String>,
    /// Worker-facing RPC endpoints for every replica.
    pub rpc_addresses: Vec<String>,
    /// This replica's index into the address lists.
    pub my_id: usize,
    /// Hint for the reducer fan-out N.
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    /// Input shard files, one per map task.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Base path for intermediate files.
    #[serde(default = "default_tmp_path")]
    pub tmp_path: PathBuf,
    /// Base path for final output files. May equal `tmp_path`.
    #[serde(default = "default_tmp_path")]
    pub output_path: PathBuf,
    /// Replication log data directory.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Wipe the replication log data directory on boot.
    #[serde(default)]
    pub clean_start: bool,
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,
    #[serde(default = "default_worker_timeout", with = "humantime_serde")]
    pub worker_timeout: Duration,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

fn default_worker_count() -> u32 {
    DEFAULT_WORKER_COUNT
}

fn default_tmp_path() -> PathBuf {
    PathBuf::from("mr-data")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("raft-data")
}

fn default_task_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

fn default_worker_timeout() -> Duration {
    DEFAULT_WORKER_TIMEOUT
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

impl Config {
    /// Load a config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.replication_addresses.is_empty() {
            return Err(Error::Config(
                "replication_addresses must not be empty".into(),
            ));
        }
        if self.replication_addresses.len() != self.rpc_addresses.len() {
            return Err(Error::Config(format!(
                "replication_addresses ({}) and rpc_addresses ({}) must be index-aligned",
                self.replication_addresses.len(),
                self.rpc_addresses.len()
            )));
        }
        if self.my_id >= self.replication_addresses.len() {
            return Err(Error::Config(format!(
                "my_id {} out of range for {} replicas",
                self.my_id,
                self.replication_addresses.len()
            )));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".into()));
        }
        Ok(())
    }

    /// This replica's replication endpoint.
    pub fn my_replication_addr(&self) -> &str {
        &self.replication_addresses[self.my_id]
    }

    /// This replica's worker-facing RPC endpoint.
    pub fn my_rpc_addr(&self) -> &str {
        &self.rpc_addresses[self.my_id]
    }

    /// Map a replication endpoint to its paired RPC endpoint, if known.
    pub fn rpc_addr_for(&self, replication_addr: &str) -> Option<&str> {
        self.replication_addresses
            .iter()
            .position(|a| a == replication_addr)
            .map(|i| self.rpc_addresses[i].as_str())
    }
}

/// Configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// RPC endpoints of every master replica.
    pub rpc_addresses: Vec<String>,
    /// Base path for intermediate files. Must be shared with the masters.
    #[serde(default = "default_tmp_path")]
    pub tmp_path: PathBuf,
    /// Base path for final output files.
    #[serde(default = "default_tmp_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

/// Derive a stable worker identity from the environment.
///
/// `GRISTMILL_WORKER_ID` wins so a restarted worker can resume its identity;
/// otherwise hostname and pid are stable enough for one process lifetime.
pub fn worker_identity() -> String {
    if let Ok(id) = std::env::var("GRISTMILL_WORKER_ID") {
        if !id.is_empty() {
            return id;
        }
    }
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            replication_addresses: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
            rpc_addresses: vec!["127.0.0.1:8001".into(), "127.0.0.1:8002".into()],
            my_id: 0,
            worker_count: 3,
            inputs: vec![],
            tmp_path: default_tmp_path(),
            output_path: default_tmp_path(),
            data_path: default_data_path(),
            clean_start: false,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    #[test]
    fn validates_aligned_address_lists() {
        assert!(base_config().validate().is_ok());

        let mut config = base_config();
        config.rpc_addresses.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_id() {
        let mut config = base_config();
        config.my_id = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn maps_replication_addr_to_rpc_addr() {
        let config = base_config();
        assert_eq!(config.rpc_addr_for("127.0.0.1:7002"), Some("127.0.0.1:8002"));
        assert_eq!(config.rpc_addr_for("10.0.0.1:9999"), None);
    }

    #[test]
    fn duration_fields_accept_humantime_strings() {
        let json = r#"{
            "replication_addresses": ["127.0.0.1:7001"],
            "rpc_addresses": ["127.0.0.1:8001"],
            "my_id": 0,
            "task_timeout": "20s",
            "worker_timeout": "1m"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.task_timeout, Duration::from_secs(20));
        assert_eq!(config.worker_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn worker_identity_is_nonempty() {
        assert!(!worker_identity().is_empty());
    }
}
