use thiserror::Error;

use crate::state::StateError;

/// Errors produced by the sync engine.
///
/// Per-gap failures (`SourceUnavailable`, `Persistence`, `Cancelled`) are
/// reported alongside the gap in [`super::SyncResult`] and leave that gap
/// uncommitted. `InvalidRange` is returned before any work starts. `Parse`
/// describes a single malformed record, which is skipped rather than failing
/// its gap.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed record: {0}")]
    Parse(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StateError),

    #[error("Cancelled before the gap was committed")]
    Cancelled,
}

impl SyncError {
    /// Whether re-invoking sync over the same span may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SourceUnavailable(_) => true,
            SyncError::Persistence(_) => true,
            SyncError::Cancelled => true,
            SyncError::InvalidRange(_) => false,
            SyncError::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_retryable() {
        assert!(SyncError::SourceUnavailable("timeout".into()).is_retryable());
    }

    #[test]
    fn test_persistence_retryable() {
        let e = SyncError::from(StateError::Query("database is locked".into()));
        assert!(e.is_retryable());
        assert!(e.to_string().contains("database is locked"));
    }

    #[test]
    fn test_invalid_range_not_retryable() {
        assert!(!SyncError::InvalidRange("start after end".into()).is_retryable());
    }

    #[test]
    fn test_parse_not_retryable() {
        assert!(!SyncError::Parse("missing date".into()).is_retryable());
    }
}
