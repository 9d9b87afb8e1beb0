//! Reduce task execution with checkpointed resumption.
//!
//! Keys are reduced in sorted order, which is what makes "skip every key
//! less than or equal to the checkpoint's last key" a correct resumption
//! boundary. Output accumulates in `mr-out-<r>.partial`; the rename to the
//! final name happens only after the last key and a final checkpoint are
//! durable.

use crate::artifact::{output, ArtifactStore};
use crate::checkpoint::ReduceCheckpoint;
use crate::error::Result;
use crate::job::ReduceFn;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Run one reduce task end to end, resuming from a checkpoint if a usable
/// one exists.
pub async fn run_reduce_task(
    store: &ArtifactStore,
    reduce_fn: ReduceFn,
    task_id: u32,
    n_map: u32,
    checkpoint_hint: Option<&str>,
    checkpoint_every: usize,
) -> Result<()> {
    let records = store.read_reduce_inputs(task_id, n_map)?;

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.key).or_default().push(record.value);
    }

    let checkpoint_path = checkpoint_hint
        .map(PathBuf::from)
        .unwrap_or_else(|| store.checkpoint_path(task_id));
    let partial_path = store.partial_output_path(task_id);

    let (mut processed, last_key, prefix) =
        resume_state(&checkpoint_path, &partial_path).await;
    if processed > 0 {
        info!(
            task_id,
            processed,
            "resuming reduce from checkpoint"
        );
    }

    // Rewrite the partial to exactly the checkpointed prefix, then append.
    tokio::fs::write(&partial_path, prefix.join("")).await?;
    let mut partial = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&partial_path)
        .await?;

    let mut since_checkpoint = 0usize;
    let mut last_written = last_key.clone();
    for (key, values) in &grouped {
        if let Some(boundary) = &last_key {
            if key <= boundary {
                continue;
            }
        }
        let value = reduce_fn(key, values);
        partial
            .write_all(output::format_line(key, &value).as_bytes())
            .await?;
        processed += 1;
        since_checkpoint += 1;
        last_written = Some(key.clone());

        if since_checkpoint >= checkpoint_every.max(1) {
            partial.flush().await?;
            ReduceCheckpoint::new(key.clone(), processed)
                .save(&checkpoint_path)
                .await?;
            since_checkpoint = 0;
            debug!(task_id, processed, "reduce checkpoint persisted");
        }
    }
    partial.flush().await?;
    partial.sync_all().await?;

    // Final checkpoint before the commit rename, so a crash between the two
    // leaves a resumable (indeed, fully finished) trail.
    if let Some(key) = &last_written {
        ReduceCheckpoint::new(key.clone(), processed)
            .save(&checkpoint_path)
            .await?;
    }

    store.commit_output(task_id).await?;
    ReduceCheckpoint::delete(&checkpoint_path).await?;
    let default_path = store.checkpoint_path(task_id);
    if default_path != checkpoint_path {
        ReduceCheckpoint::delete(&default_path).await?;
    }
    info!(task_id, keys = processed, "reduce output committed");
    Ok(())
}

/// Work out where to resume: the checkpoint is trusted only if the partial
/// file actually contains at least the lines it claims were processed.
async fn resume_state(
    checkpoint_path: &Path,
    partial_path: &Path,
) -> (i64, Option<String>, Vec<String>) {
    let Some(checkpoint) = ReduceCheckpoint::load(checkpoint_path).await else {
        return (0, None, Vec::new());
    };
    let contents = tokio::fs::read_to_string(partial_path)
        .await
        .unwrap_or_default();
    let lines: Vec<String> = contents
        .lines()
        .map(|l| format!("{l}\n"))
        .collect();
    if (lines.len() as i64) < checkpoint.processed {
        warn!(
            partial = %partial_path.display(),
            have = lines.len(),
            claimed = checkpoint.processed,
            "partial output shorter than checkpoint claims; starting over"
        );
        return (0, None, Vec::new());
    }
    let prefix = lines[..checkpoint.processed as usize].to_vec();
    (checkpoint.processed, Some(checkpoint.last_key), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{word_count_reduce, KeyValue};
    use tempfile::TempDir;

    fn kv(key: &str) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: "1".into(),
        }
    }

    async fn seed_inputs(store: &ArtifactStore, reduce_id: u32, per_map: &[Vec<KeyValue>]) {
        for (m, records) in per_map.iter().enumerate() {
            store
                .write_intermediate(m as u32, reduce_id, records)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn reduces_sorted_union_of_intermediates() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        seed_inputs(
            &store,
            0,
            &[vec![kv("b"), kv("a")], vec![kv("a"), kv("c")]],
        )
        .await;

        run_reduce_task(&store, word_count_reduce, 0, 2, None, 100)
            .await
            .unwrap();

        let out = output::read_as_map(&store.output_path(0)).unwrap();
        assert_eq!(out.get("a").map(String::as_str), Some("2"));
        assert_eq!(out.get("b").map(String::as_str), Some("1"));
        assert_eq!(out.get("c").map(String::as_str), Some("1"));
        assert!(!store.partial_output_path(0).exists());
        assert!(!store.checkpoint_path(0).exists());
    }

    #[tokio::test]
    async fn resumes_after_simulated_crash() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        seed_inputs(&store, 1, &[vec![kv("a"), kv("b"), kv("c"), kv("d")]]).await;

        // A predecessor processed "a" and "b", checkpointed, then died
        // before the rename. Its partial holds exactly those lines.
        tokio::fs::write(store.partial_output_path(1), "a 1\nb 1\n")
            .await
            .unwrap();
        ReduceCheckpoint::new("b".into(), 2)
            .save(&store.checkpoint_path(1))
            .await
            .unwrap();

        run_reduce_task(&store, word_count_reduce, 1, 1, None, 1)
            .await
            .unwrap();

        let out = output::read_as_map(&store.output_path(1)).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out.get("d").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn untrustworthy_checkpoint_restarts_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        seed_inputs(&store, 0, &[vec![kv("a"), kv("b")]]).await;

        // Checkpoint claims more progress than the partial shows.
        ReduceCheckpoint::new("b".into(), 2)
            .save(&store.checkpoint_path(0))
            .await
            .unwrap();

        run_reduce_task(&store, word_count_reduce, 0, 1, None, 100)
            .await
            .unwrap();

        let out = output::read_as_map(&store.output_path(0)).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn crash_and_rerun_produces_identical_output() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        let inputs = vec![vec![kv("x"), kv("y"), kv("x"), kv("z"), kv("w")]];
        seed_inputs(&store, 0, &inputs).await;

        // Full run in a pristine copy gives the reference output.
        let reference_dir = TempDir::new().unwrap();
        let reference_store = ArtifactStore::new(reference_dir.path(), reference_dir.path());
        seed_inputs(&reference_store, 0, &inputs).await;
        run_reduce_task(&reference_store, word_count_reduce, 0, 1, None, 100)
            .await
            .unwrap();

        // Crashed attempt: one key processed, checkpoint written, no rename.
        tokio::fs::write(store.partial_output_path(0), "w 1\n")
            .await
            .unwrap();
        ReduceCheckpoint::new("w".into(), 1)
            .save(&store.checkpoint_path(0))
            .await
            .unwrap();

        run_reduce_task(&store, word_count_reduce, 0, 1, None, 1)
            .await
            .unwrap();

        assert_eq!(
            output::read_as_map(&store.output_path(0)).unwrap(),
            output::read_as_map(&reference_store.output_path(0)).unwrap()
        );
    }

    #[tokio::test]
    async fn honors_explicit_checkpoint_hint() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), dir.path());
        seed_inputs(&store, 0, &[vec![kv("a"), kv("b")]]).await;

        let hint = dir.path().join("relocated.checkpoint.json");
        tokio::fs::write(store.partial_output_path(0), "a 1\n")
            .await
            .unwrap();
        ReduceCheckpoint::new("a".into(), 1)
            .save(&hint)
            .await
            .unwrap();

        run_reduce_task(
            &store,
            word_count_reduce,
            0,
            1,
            Some(hint.to_str().unwrap()),
            100,
        )
        .await
        .unwrap();

        let out = output::read_as_map(&store.output_path(0)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!hint.exists());
    }
}
