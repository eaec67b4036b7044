//! Version gate: marker blobs that make finalization idempotent.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{join_key, BlobStore};

/// Records and checks which versions have been finalized.
#[derive(Clone)]
pub struct VersionGate {
    store: Arc<dyn BlobStore>,
    semaphore_blob: String,
    finalize_container: String,
}

impl VersionGate {
    pub fn new(
        store: Arc<dyn BlobStore>,
        semaphore_blob: impl Into<String>,
        finalize_container: impl Into<String>,
    ) -> Self {
        Self {
            store,
            semaphore_blob: semaphore_blob.into(),
            finalize_container: finalize_container.into(),
        }
    }

    /// Key of the marker blob for `version`
    #[must_use]
    pub fn marker_path(&self, version: &str) -> String {
        join_key(&self.finalize_container, version)
    }

    /// Whether a marker blob exists for `version`.
    pub async fn is_finalized(&self, version: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.marker_path(version)).await
    }

    /// Create the semaphore blob if it is missing.
    pub async fn ensure_semaphore_exists(&self) -> Result<(), StoreError> {
        self.ensure_exists(&self.semaphore_blob).await
    }

    /// Create the marker blob for `version` if it is missing.
    pub async fn ensure_marker_exists(&self, version: &str) -> Result<(), StoreError> {
        self.ensure_exists(&self.marker_path(version)).await
    }

    // Two callers may both see the blob missing and both write it; presence is
    // all that matters, so the second write is harmless.
    async fn ensure_exists(&self, path: &str) -> Result<(), StoreError> {
        if self.store.exists(path).await? {
            debug!(path = %path, "Blob already present");
            return Ok(());
        }
        self.store
            .put_string(path, &Utc::now().to_rfc3339())
            .await?;
        debug!(path = %path, "Created placeholder blob");
        Ok(())
    }
}
