//! Line-oriented reduce output codec.
//!
//! `mr-out-<r>` holds one `key<SP>value` record per line with a trailing
//! newline. A file is valid only if it is non-empty and every line splits
//! into a non-empty key and a value. Reducers write `mr-out-<r>.partial`
//! while running and rename on commit.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Render one output line.
pub fn format_line(key: &str, value: &str) -> String {
    format!("{key} {value}\n")
}

/// Parse a whole output file into key/value pairs.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>> {
    if contents.is_empty() {
        return Err(Error::Validation("empty output file".into()));
    }
    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let (key, value) = line
            .split_once(' ')
            .ok_or_else(|| Error::Validation(format!("malformed output line {}", lineno + 1)))?;
        if key.is_empty() {
            return Err(Error::Validation(format!("empty key on line {}", lineno + 1)));
        }
        records.push((key.to_string(), value.to_string()));
    }
    Ok(records)
}

/// Whether the file at `path` is a well-formed, non-empty output artifact.
pub fn is_valid(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents).is_ok(),
        Err(_) => false,
    }
}

/// Read an output file as a key-to-value map, for tests and introspection.
pub fn read_as_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse(&contents)?.into_iter().collect())
}
