//! Durable replication state.
//!
//! Three files live in the data directory: `hard_state.json` (term and vote,
//! rewritten atomically), `log.jsonl` (one entry per line, appended on the
//! hot path and rewritten only on truncation or compaction), and
//! `snapshot.json` (the serialized state machine, rewritten atomically).

use super::log::LogEntry;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Term and vote, which must survive restarts for election safety.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
}

/// A persisted state-machine snapshot plus its log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub data: serde_json::Value,
}

/// Everything loaded at boot.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<PersistedSnapshot>,
}

/// File-backed persistence for one replica.
#[derive(Debug)]
pub struct RaftStorage {
    dir: PathBuf,
}

impl RaftStorage {
    /// Open (and create) the data directory. `clean_start` wipes it first.
    pub async fn open(dir: impl Into<PathBuf>, clean_start: bool) -> Result<Self> {
        let dir = dir.into();
        if clean_start && dir.exists() {
            info!(dir = %dir.display(), "clean start: wiping replication data");
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hard_state.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    /// Load whatever survived the last run. A missing file is a fresh state;
    /// a corrupt log tail (torn write) is truncated at the first bad line.
    pub async fn load(&self) -> Result<LoadedState> {
        let mut loaded = LoadedState::default();

        match tokio::fs::read(self.hard_state_path()).await {
            Ok(bytes) => loaded.hard_state = serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match tokio::fs::read_to_string(self.log_path()).await {
            Ok(contents) => {
                for line in contents.lines() {
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => loaded.entries.push(entry),
                        Err(err) => {
                            warn!(%err, "truncating replication log at torn tail");
                            break;
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match tokio::fs::read(self.snapshot_path()).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedSnapshot>(&bytes) {
                Ok(snapshot) => loaded.snapshot = Some(snapshot),
                Err(err) => {
                    return Err(Error::SnapshotRestore(format!(
                        "unreadable snapshot at {}: {err}",
                        self.snapshot_path().display()
                    )))
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Entries the snapshot already covers are dead weight.
        if let Some(snapshot) = &loaded.snapshot {
            let boundary = snapshot.last_index;
            loaded.entries.retain(|e| e.index > boundary);
        }

        Ok(loaded)
    }

    pub async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        write_atomic(&self.hard_state_path(), &serde_json::to_vec(state)?).await
    }

    /// Append one entry to the log file.
    pub async fn append_entry(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the whole log file, used after truncation or compaction.
    pub async fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
        let mut contents = Vec::new();
        for entry in entries {
            contents.extend(serde_json::to_vec(entry)?);
            contents.push(b'\n');
        }
        write_atomic(&self.log_path(), &contents).await
    }

    pub async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        write_atomic(&self.snapshot_path(), &serde_json::to_vec(snapshot)?).await
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
