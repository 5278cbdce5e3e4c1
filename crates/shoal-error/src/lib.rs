#![forbid(unsafe_code)]
//! Error types for the shoal repair scheduler.
//!
//! Defines `ShoalError` and a `Result<T>` alias used throughout the workspace.
//! Includes the fatal classification used by the manager's fatal latch.

use thiserror::Error;

/// Unified error type for all repair-scheduler operations.
#[derive(Debug, Error)]
pub enum ShoalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("task switch is paused")]
    TaskPaused,

    #[error("no task available for worker")]
    TaskEmpty,

    #[error("no task in queue")]
    NoTaskInQueue,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("reported locations do not match leased task: {0}")]
    UnmatchedLocation(String),

    #[error("volume commit rejected: old vuid does not match")]
    OldVuidNotMatch,

    #[error("volume commit rejected: new vuid does not match")]
    NewVuidNotMatch,

    #[error("destination chunk unreachable")]
    StatChunkFailed,

    #[error("cluster manager call failed: {0}")]
    Rpc(String),

    #[error("task store failure: {0}")]
    Store(String),

    #[error("corrupt task record: {0}")]
    CorruptRecord(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl ShoalError {
    /// True for errors that indicate corrupted state the manager must not
    /// reconcile silently. These are routed to the fatal latch rather than
    /// retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::CorruptRecord(_) | Self::OldVuidNotMatch
        )
    }
}

/// Result alias using `ShoalError`.
pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_covers_corruption_kinds() {
        assert!(ShoalError::Invariant("two disks in task set".to_owned()).is_fatal());
        assert!(ShoalError::CorruptRecord("state byte 111".to_owned()).is_fatal());
        assert!(ShoalError::OldVuidNotMatch.is_fatal());

        assert!(!ShoalError::NewVuidNotMatch.is_fatal());
        assert!(!ShoalError::Rpc("timeout".to_owned()).is_fatal());
        assert!(!ShoalError::TaskEmpty.is_fatal());
        assert!(!ShoalError::Cancelled.is_fatal());
    }
}
