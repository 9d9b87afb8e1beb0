//! Map and reduce function types plus the built-in word count job.
//!
//! User functions are assumed deterministic; the master only guarantees that
//! with deterministic functions the final outputs match a single-machine run.

use serde::{Deserialize, Serialize};

/// A single key/value pair flowing between the map and reduce phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Map function: shard name and shard contents to emitted pairs.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;

/// Reduce function: key and every value emitted for it to one output value.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// Word count map: split on non-alphanumeric boundaries, emit `(word, "1")`.
pub fn word_count_map(_shard: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| KeyValue {
            key: w.to_string(),
            value: "1".to_string(),
        })
        .collect()
}

/// Word count reduce: the count is the number of values for the key.
pub fn word_count_reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}
