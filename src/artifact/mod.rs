//! On-disk layout for intermediate and output artifacts.
//!
//! The artifact store owns every file the job produces. There is no
//! cross-host locking; exclusivity comes entirely from atomic renames of
//! `.tmp` and `.partial` files into their final names.

pub mod intermediate;
pub mod output;

use crate::error::Result;
use crate::job::KeyValue;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Path layout and validation for a job's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    tmp_path: PathBuf,
    output_path: PathBuf,
}

impl ArtifactStore {
    pub fn new(tmp_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            tmp_path: tmp_path.into(),
            output_path: output_path.into(),
        }
    }

    /// Create both base directories.
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.tmp_path).await?;
        tokio::fs::create_dir_all(&self.output_path).await?;
        Ok(())
    }

    /// `mr-intermediate-<m>-<r>` under the tmp base.
    pub fn intermediate_path(&self, map_id: u32, reduce_id: u32) -> PathBuf {
        self.tmp_path
            .join(format!("mr-intermediate-{map_id}-{reduce_id}"))
    }

    /// `mr-out-<r>` under the output base.
    pub fn output_path(&self, reduce_id: u32) -> PathBuf {
        self.output_path.join(format!("mr-out-{reduce_id}"))
    }

    /// `mr-out-<r>.partial`, the in-progress output file.
    pub fn partial_output_path(&self, reduce_id: u32) -> PathBuf {
        self.output_path.join(format!("mr-out-{reduce_id}.partial"))
    }

    /// `mr-out-<r>.checkpoint.json`, the reduce progress record.
    pub fn checkpoint_path(&self, reduce_id: u32) -> PathBuf {
        self.output_path
            .join(format!("mr-out-{reduce_id}.checkpoint.json"))
    }

    /// Whether every intermediate a map task must produce exists and decodes.
    pub fn map_artifacts_valid(&self, map_id: u32, n_reduce: u32) -> bool {
        (0..n_reduce).all(|r| intermediate::is_valid(&self.intermediate_path(map_id, r)))
    }

    /// Whether the final output of a reduce task exists and parses.
    pub fn reduce_artifact_valid(&self, reduce_id: u32) -> bool {
        output::is_valid(&self.output_path(reduce_id))
    }

    /// Whether every map task in `[0, n_map)` has valid intermediates.
    pub fn all_map_artifacts_valid(&self, n_map: u32, n_reduce: u32) -> bool {
        (0..n_map).all(|m| self.map_artifacts_valid(m, n_reduce))
    }

    /// Write one intermediate file whole, then rename into place.
    pub async fn write_intermediate(
        &self,
        map_id: u32,
        reduce_id: u32,
        records: &[KeyValue],
    ) -> Result<()> {
        let path = self.intermediate_path(map_id, reduce_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, intermediate::encode(records)).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(map_id, reduce_id, records = records.len(), "wrote intermediate");
        Ok(())
    }

    /// Read every intermediate feeding one reduce partition.
    pub fn read_reduce_inputs(&self, reduce_id: u32, n_map: u32) -> Result<Vec<KeyValue>> {
        let mut records = Vec::new();
        for m in 0..n_map {
            records.extend(intermediate::read(&self.intermediate_path(m, reduce_id))?);
        }
        Ok(records)
    }

    /// Rename a completed partial output into its final name.
    pub async fn commit_output(&self, reduce_id: u32) -> Result<()> {
        tokio::fs::rename(self.partial_output_path(reduce_id), self.output_path(reduce_id))
            .await?;
        Ok(())
    }

    /// Delete every intermediate a map task produced. Missing files are fine.
    pub async fn clean_map_artifacts(&self, map_id: u32, n_reduce: u32) {
        for r in 0..n_reduce {
            remove_quietly(&self.intermediate_path(map_id, r)).await;
        }
    }

    /// Delete a reduce task's output and partial. The checkpoint is left
    /// alone so a reassigned reducer can resume from it.
    pub async fn clean_reduce_artifacts(&self, reduce_id: u32) {
        remove_quietly(&self.output_path(reduce_id)).await;
        remove_quietly(&self.partial_output_path(reduce_id)).await;
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove artifact"),
    }
}
