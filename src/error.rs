//! Error taxonomy for memctl.
//!
//! Five kinds, each with its own propagation policy:
//! policy rejections and validation errors surface to the user (exit 1),
//! integrity errors identify duplicate-content writes, transient errors are
//! retried with bounded backoff at the store layer, and fatal errors mean
//! the store itself is unusable (exit 2).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MemctlError {
    /// The policy engine refused the write. Never retried.
    #[error("policy rejected ({rule_id}): {reason}")]
    PolicyRejected { rule_id: String, reason: String },

    /// Bad arguments or malformed input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A store invariant would be violated (e.g. duplicate content hash
    /// within a scope).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Retriable I/O: lock contention, a file that vanished mid-scan.
    #[error("transient error: {0}")]
    Transient(String),

    /// Corruption or an invariant violation the caller cannot recover from.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("no extractor for {ext:?} files: {hint} ({path})", path = .path.display())]
    MissingExtractor {
        ext: String,
        hint: String,
        path: PathBuf,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MemctlError {
    /// CLI exit code contract: 0 success, 1 operational error, 2 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyRejected { .. }
            | Self::Validation(_)
            | Self::Integrity(_)
            | Self::NotFound(_)
            | Self::MissingExtractor { .. }
            | Self::Transient(_)
            | Self::Io(_)
            | Self::Json(_) => 1,
            Self::Fatal(_) | Self::Database(_) => 2,
        }
    }

    /// True when retrying with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }
}

pub type Result<T, E = MemctlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        let reject = MemctlError::PolicyRejected {
            rule_id: "secret.github-pat".into(),
            reason: "secret detected".into(),
        };
        assert_eq!(reject.exit_code(), 1);
        assert_eq!(MemctlError::Validation("bad".into()).exit_code(), 1);
        assert_eq!(MemctlError::Fatal("corrupt".into()).exit_code(), 2);
    }

    #[test]
    fn busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(MemctlError::Database(busy).is_transient());
        assert!(!MemctlError::Validation("x".into()).is_transient());
    }
}
