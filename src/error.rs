use std::time::Duration;

use thiserror::Error;

/// Main error type for tidepool operations
#[derive(Error, Debug)]
pub enum TidepoolError {
    #[error("Corrupt data in {resource}: {reason}")]
    CorruptData { resource: String, reason: String },

    #[error("No index catalog found in directory")]
    NoCatalog,

    #[error("Write lock held by another writer (waited {waited:?})")]
    LockTimeout { waited: Duration },

    #[error("Writer already closed: {0}")]
    AlreadyClosed(String),

    #[error("Aborting failure: {0}")]
    Aborting(String),

    #[error("Document rejected: {0}")]
    NonAborting(String),

    #[error("Merge aborted")]
    MergeAborted,

    #[error("Unknown codec identifier: {0}")]
    UnknownCodec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for tidepool operations
pub type Result<T> = std::result::Result<T, TidepoolError>;

impl TidepoolError {
    /// An aborting failure discards the in-progress segment or merge but
    /// leaves the writer usable.
    pub fn is_aborting(&self) -> bool {
        matches!(self, TidepoolError::Aborting(_))
    }

    /// Non-aborting failures skip a single document and continue.
    pub fn is_non_aborting(&self) -> bool {
        matches!(self, TidepoolError::NonAborting(_))
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TidepoolError::LockTimeout { .. } | TidepoolError::Io(_)
        )
    }

    pub(crate) fn corrupt(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        TidepoolError::CorruptData {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TidepoolError::UnknownCodec("mystery-v9".to_string());
        assert_eq!(err.to_string(), "Unknown codec identifier: mystery-v9");
    }

    #[test]
    fn test_error_classification() {
        assert!(TidepoolError::Aborting("disk full".into()).is_aborting());
        assert!(!TidepoolError::Aborting("disk full".into()).is_non_aborting());
        assert!(TidepoolError::NonAborting("empty field".into()).is_non_aborting());
        assert!(TidepoolError::LockTimeout {
            waited: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!TidepoolError::NoCatalog.is_transient());
    }

    #[test]
    fn test_corrupt_vs_missing_are_distinct() {
        let corrupt = TidepoolError::corrupt("cat_3.bin", "checksum mismatch");
        assert!(matches!(corrupt, TidepoolError::CorruptData { .. }));
        assert!(matches!(TidepoolError::NoCatalog, TidepoolError::NoCatalog));
    }
}
