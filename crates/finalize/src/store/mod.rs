//! Blob store facade.
//!
//! The finalization protocol only needs a handful of primitives against a
//! single flat container: prefix listing, server-side copy, delete, string
//! upload, and an exclusive lease on one blob. [`BlobStore`] is that contract;
//! every component receives the store explicitly as an `Arc<dyn BlobStore>`.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

/// An exclusive hold on a blob, as granted by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    id: Uuid,
    path: String,
    duration: Duration,
    acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Create a fresh lease record for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            duration,
            acquired_at: Utc::now(),
        }
    }

    /// Lease identifier presented on renew and release
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Blob the lease is held on
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time the lease stays valid without renewal
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// When the lease was granted
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Storage primitives the finalization protocol runs against.
///
/// Implementations address blobs by `/`-separated string keys inside one
/// named container and must be usable across tasks.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the container this store is bound to.
    fn container(&self) -> &str;

    /// List every blob whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Copy `source` to `dest`, overwriting `dest` if it exists.
    async fn copy(&self, source: &str, dest: &str) -> Result<(), StoreError>;

    /// Delete the blob at `path`.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Upload `content` as the blob at `path`.
    async fn put_string(&self, path: &str, content: &str) -> Result<(), StoreError>;

    /// Try once to take an exclusive lease on `path`.
    ///
    /// Returns `Ok(None)` when another holder owns an unexpired lease.
    async fn try_acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Extend a held lease by its duration.
    async fn renew_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Give up a lease. Releasing a lease that is no longer held is not an error.
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Whether a blob exists at exactly `path`.
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let listed = self.list(path).await?;
        Ok(listed
            .iter()
            .any(|key| blob_name(key, self.container()) == path))
    }
}

/// Strip a leading `/<container>/` root from a listed blob path.
///
/// Some backends report absolute paths that include the container; the
/// protocol always works with container-relative keys.
#[must_use]
pub fn blob_name<'a>(path: &'a str, container: &str) -> &'a str {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed
        .strip_prefix(container)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(trimmed)
}

/// Last `/`-separated segment of a blob key.
#[must_use]
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Join a key prefix and a name with exactly one `/`.
#[must_use]
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
