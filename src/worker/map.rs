//! Map task execution.
//!
//! Reads the input shard, runs the user map function, partitions the emitted
//! pairs by key hash, and writes all `n_reduce` intermediates (empty buckets
//! included, so the master can validate the full set). Each file is written
//! whole and renamed into place.

use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::job::MapFn;
use tracing::debug;

/// Stable key partitioning (FNV-1a). Must agree across worker processes so
/// every occurrence of a key lands in the same reduce partition.
pub fn partition(key: &str, n_reduce: u32) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    (hash % u64::from(n_reduce.max(1))) as u32
}

/// Run one map task end to end.
pub async fn run_map_task(
    store: &ArtifactStore,
    map_fn: MapFn,
    task_id: u32,
    input: &str,
    n_reduce: u32,
) -> Result<()> {
    let contents = tokio::fs::read_to_string(input).await?;
    let pairs = map_fn(input, &contents);
    debug!(task_id, input, pairs = pairs.len(), "map function finished");

    let mut buckets = vec![Vec::new(); n_reduce as usize];
    for pair in pairs {
        let r = partition(&pair.key, n_reduce) as usize;
        buckets[r].push(pair);
    }
    for (r, records) in buckets.iter().enumerate() {
        store
            .write_intermediate(task_id, r as u32, records)
            .await?;
    }
    Ok(())
}
