//! Error types for the PodMonitor operator
//!
//! Store failures carry the object kind and key they concern. The worker
//! loop decides retry vs. drop through [`Error::is_retryable`].

use thiserror::Error;

/// Failures reported by the authoritative resource store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind (PodMonitor, Pod)
        kind: &'static str,
        /// namespace/name of the object
        key: String,
    },

    /// Write carried a stale version token
    #[error("conflict writing {kind} {key}: observed version {observed}, current {current}")]
    Conflict {
        kind: &'static str,
        key: String,
        /// Version the writer last read
        observed: u64,
        /// Version held by the store
        current: u64,
    },

    /// Create raced with an existing object of the same name
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Store unreachable, timed out, or otherwise transiently failing
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Main error type for reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Error surfaced by the resource store
    #[error("store error: {source}")]
    Store {
        #[from]
        source: StoreError,
    },

    /// Queue key that cannot be split into namespace/name
    #[error("invalid resource key {key:?}: {message}")]
    MalformedKey { key: String, message: String },

    /// The child pod name is taken by a pod some other controller owns
    #[error("pod {pod} exists but is not controlled by PodMonitor {owner}")]
    ChildNotOwned { pod: String, owner: String },

    /// Shutdown arrived before the watch cache finished its initial list
    #[error("watch cache did not sync before shutdown")]
    CacheSyncAborted,

    /// Child-side environment contract violated
    #[error("invalid monitor environment: {message}")]
    Environment { message: String },
}

impl Error {
    /// Whether the failed key should be re-added with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { .. } | Error::ChildNotOwned { .. } => true,
            Error::MalformedKey { .. } | Error::CacheSyncAborted | Error::Environment { .. } => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        let conflict: Error = StoreError::Conflict {
            kind: "PodMonitor",
            key: "ns/x".to_string(),
            observed: 1,
            current: 2,
        }
        .into();
        assert!(conflict.is_retryable());

        let transient: Error = StoreError::unavailable("connection refused").into();
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_malformed_key_is_not_retryable() {
        let err = Error::MalformedKey {
            key: "a/b/c".to_string(),
            message: "unexpected extra '/'".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("a/b/c"));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::not_found("Pod", "ns/pm-x");
        assert_eq!(err.to_string(), "Pod ns/pm-x not found");
        assert!(err.is_not_found());
    }
}
