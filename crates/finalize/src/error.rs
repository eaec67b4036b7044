//! Error types for build finalization.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`crate::BlobStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The blob does not exist
    #[error("Blob not found: {path}")]
    NotFound { path: String },

    /// Filesystem or transport failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The lease presented is not the one currently held on the blob
    #[error("Lease on {path} is not held by this holder")]
    LeaseMismatch { path: String },

    /// Lease file could not be encoded or decoded
    #[error("Lease record error: {0}")]
    LeaseRecord(#[from] serde_json::Error),

    /// Other backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort a finalization run.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The semaphore lease could not be acquired within the wait window
    #[error("Timed out after {waited:?} waiting for lease on {path}")]
    LeaseTimeout { path: String, waited: Duration },

    /// The lease could not be renewed while work was running under it
    #[error("Lost lease on {path}: {reason}")]
    LeaseLost { path: String, reason: String },

    /// A store call the protocol cannot tolerate failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration is missing a required value or is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// Result alias used across the crate.
pub type FinalizeResult<T> = Result<T, FinalizeError>;
