//! Reduce-side progress checkpoints.
//!
//! A reducer walks its keys in sorted order and persists a checkpoint every
//! `CHECKPOINT_EVERY` keys. On reassignment the successor reloads the latest
//! checkpoint and skips every key less than or equal to `last_key`; sorted
//! iteration is what makes that boundary valid.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Persist a checkpoint after this many processed keys.
pub const CHECKPOINT_EVERY: usize = 100;

/// Checkpoints older than this are treated as absent.
pub const CHECKPOINT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Progress record written atomically by a reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCheckpoint {
    /// Last key fully reduced and flushed to the partial output.
    pub last_key: String,
    /// Number of keys processed so far, including `last_key`.
    pub processed: i64,
    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,
}

impl ReduceCheckpoint {
    pub fn new(last_key: String, processed: i64) -> Self {
        Self {
            last_key,
            processed,
            timestamp: Utc::now(),
        }
    }

    /// A checkpoint is usable only if it is fresh and internally sane.
    pub fn is_valid(&self) -> bool {
        if self.processed < 0 {
            return false;
        }
        let age = Utc::now().signed_duration_since(self.timestamp);
        match age.to_std() {
            Ok(age) => age <= CHECKPOINT_MAX_AGE,
            // Future-dated timestamps come from clock skew; accept them.
            Err(_) => true,
        }
    }

    /// Write atomically: serialize to a `.tmp` sibling, then rename.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(
            path = %path.display(),
            processed = self.processed,
            last_key = %self.last_key,
            "saved reduce checkpoint"
        );
        Ok(())
    }

    /// Load a checkpoint if one exists and passes the validity rules.
    ///
    /// A missing file, unparseable contents, or a stale record all come back
    /// as `None`; the reducer then starts from the beginning.
    pub async fn load(path: &Path) -> Option<Self> {
        let contents = tokio::fs::read(path).await.ok()?;
        let checkpoint: ReduceCheckpoint = match serde_json::from_slice(&contents) {
            Ok(cp) => cp,
            Err(err) => {
                warn!(path = %path.display(), %err, "discarding unparseable checkpoint");
                return None;
            }
        };
        if !checkpoint.is_valid() {
            warn!(
                path = %path.display(),
                processed = checkpoint.processed,
                "discarding stale or corrupt checkpoint"
            );
            return None;
        }
        Some(checkpoint)
    }

    /// Remove a checkpoint once the owning reduce task is completed.
    pub async fn delete(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
