//! Unified error type for the master, worker, and replication layers.
//!
//! Errors are ordered roughly by severity: transient remote failures and
//! not-leader redirects are retriable, validation failures require the caller
//! to re-run work, and snapshot restore failures are fatal for the replica.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by gristmill components.
#[derive(Debug, Error)]
pub enum Error {
    /// The contacted replica is not the leader. Carries the best-known
    /// leader address so the caller can redirect instead of rediscovering.
    #[error("not the leader{}", fmt_hint(.0))]
    NotLeader(Option<String>),

    /// A claimed completion did not validate against on-disk artifacts.
    /// The task stays in progress until the timeout monitor resets it.
    #[error("artifact validation failed: {0}")]
    Validation(String),

    /// A proposed command failed to commit. The state machine is untouched;
    /// the caller may retry.
    #[error("replication failed: {0}")]
    Replication(String),

    /// The replica cannot serve the request right now (e.g. recovery is
    /// still reconciling after a leader change). Retriable.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// Restoring a snapshot failed. Fatal for this replica; it must be
    /// restarted with a clean data directory.
    #[error("snapshot restore failed: {0}")]
    SnapshotRestore(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Error {
    /// Whether the caller may retry the operation as-is (possibly against
    /// another replica) and expect it to eventually succeed. The RPC layer
    /// maps retriable errors onto the `Retry` envelope variant, so this is
    /// the single source of truth for the severity split.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_)
                | Error::Replication(_)
                | Error::Unavailable(_)
                | Error::Transport(_)
                | Error::Io(_)
        )
    }
}

fn fmt_hint(hint: &Option<String>) -> String {
    match hint {
        Some(addr) => format!(" (leader: {addr})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_formats_hint() {
        let err = Error::NotLeader(Some("127.0.0.1:7101".into()));
        assert_eq!(err.to_string(), "not the leader (leader: 127.0.0.1:7101)");
        assert_eq!(Error::NotLeader(None).to_string(), "not the leader");
    }

    #[test]
    fn retriability_matches_severity() {
        assert!(Error::NotLeader(None).is_retriable());
        assert!(Error::Replication("commit timeout".into()).is_retriable());
        assert!(Error::Io(std::io::Error::other("disk hiccup")).is_retriable());
        assert!(!Error::Validation("empty intermediate".into()).is_retriable());
        assert!(!Error::SnapshotRestore("bad json".into()).is_retriable());
    }
}
