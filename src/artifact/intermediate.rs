//! Length-prefixed intermediate record codec.
//!
//! `mr-intermediate-<m>-<r>` holds the pairs map task `m` emitted for reduce
//! partition `r`: for each record a little-endian u32 key length, the key
//! bytes, a u32 value length, then the value bytes. A file is valid only if
//! it exists and decodes cleanly end-to-end; zero records is a legitimate
//! bucket whose keys all hashed elsewhere.

use crate::error::{Error, Result};
use crate::job::KeyValue;
use std::path::Path;

/// Hard cap on a single key or value, to reject corrupt length prefixes
/// before they turn into huge allocations.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Encode records into the on-disk representation.
pub fn encode(records: &[KeyValue]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(record.key.as_bytes());
        buf.extend_from_slice(&(record.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(record.value.as_bytes());
    }
    buf
}

/// Decode a whole intermediate file. Trailing bytes, truncated fields, and
/// non-UTF-8 contents all fail the decode.
pub fn decode(bytes: &[u8]) -> Result<Vec<KeyValue>> {
    let mut records = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (key, after_key) = take_field(rest)?;
        let (value, after_value) = take_field(after_key)?;
        records.push(KeyValue { key, value });
        rest = after_value;
    }
    Ok(records)
}

fn take_field(bytes: &[u8]) -> Result<(String, &[u8])> {
    if bytes.len() < 4 {
        return Err(Error::Validation("truncated length prefix".into()));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FIELD_LEN {
        return Err(Error::Validation(format!("implausible field length {len}")));
    }
    let len = len as usize;
    let rest = &bytes[4..];
    if rest.len() < len {
        return Err(Error::Validation("truncated field body".into()));
    }
    let field = std::str::from_utf8(&rest[..len])
        .map_err(|_| Error::Validation("non-utf8 field".into()))?
        .to_string();
    Ok((field, &rest[len..]))
}

/// Read and decode one intermediate file.
pub fn read(path: &Path) -> Result<Vec<KeyValue>> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Whether the file at `path` is a well-formed intermediate.
///
/// Zero records is legal: a map task whose keys all hash elsewhere still
/// writes the file, and the whole-file rename means an existing empty file
/// was written deliberately rather than torn.
pub fn is_valid(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => decode(&bytes).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<KeyValue> {
        vec![
            KeyValue {
                key: "apple".into(),
                value: "1".into(),
            },
            KeyValue {
                key: "".into(),
                value: "empty key is legal".into(),
            },
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        let records = sample();
        assert_eq!(decode(&encode(&records)).unwrap(), records);
    }

    #[test]
    fn truncated_file_fails_decode() {
        let mut bytes = encode(&sample());
        bytes.truncate(bytes.len() - 3);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn trailing_garbage_fails_decode() {
        let mut bytes = encode(&sample());
        bytes.push(0x7f);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn implausible_length_rejected() {
        let bytes = u32::MAX.to_le_bytes().to_vec();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn empty_file_is_a_valid_empty_bucket() {
        assert!(decode(&[]).unwrap().is_empty());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mr-intermediate-0-0");
        std::fs::write(&path, []).unwrap();
        assert!(is_valid(&path));
    }

    #[test]
    fn missing_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        assert!(!is_valid(&dir.path().join("mr-intermediate-3-1")));
    }

    #[test]
    fn valid_file_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mr-intermediate-0-1");
        std::fs::write(&path, encode(&sample())).unwrap();
        assert!(is_valid(&path));
        assert_eq!(read(&path).unwrap(), sample());
    }
}
