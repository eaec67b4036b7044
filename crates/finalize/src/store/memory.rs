//! In-process blob store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{BlobStore, Lease};
use crate::error::StoreError;

struct HeldLease {
    id: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    blobs: BTreeMap<String, String>,
    leases: HashMap<String, HeldLease>,
}

/// Blob store kept entirely in memory, with expiring exclusive leases.
pub struct MemoryBlobStore {
    container: String,
    state: Mutex<MemoryState>,
}

impl MemoryBlobStore {
    /// Create an empty store for `container`.
    #[must_use]
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Create a store pre-populated with `(key, content)` pairs.
    #[must_use]
    pub fn with_blobs<I, K, V>(container: impl Into<String>, blobs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new(container);
        {
            let mut state = store.state();
            for (key, content) in blobs {
                state.blobs.insert(key.into(), content.into());
            }
        }
        store
    }

    /// Insert or overwrite a blob without going through the async API.
    pub fn insert(&self, key: impl Into<String>, content: impl Into<String>) {
        self.state().blobs.insert(key.into(), content.into());
    }

    /// Content of the blob at `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.state().blobs.get(key).cloned()
    }

    /// Every key in the store, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state().blobs.keys().cloned().collect()
    }

    /// Whether `key` currently carries an unexpired lease.
    #[must_use]
    pub fn is_leased(&self, key: &str) -> bool {
        self.state()
            .leases
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state()
            .blobs
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let content = state
            .blobs
            .get(source)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: source.to_string(),
            })?;
        state.blobs.insert(dest.to_string(), content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        match self.state().blobs.remove(path) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn put_string(&self, path: &str, content: &str) -> Result<(), StoreError> {
        self.state()
            .blobs
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state();
        if !state.blobs.contains_key(path) {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }

        let now = Instant::now();
        if let Some(held) = state.leases.get(path) {
            if held.expires_at > now {
                debug!(path = %path, "Lease held by another holder");
                return Ok(None);
            }
        }

        let lease = Lease::new(path, duration);
        state.leases.insert(
            path.to_string(),
            HeldLease {
                id: lease.id(),
                expires_at: now + duration,
            },
        );
        Ok(Some(lease))
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.leases.get_mut(lease.path()) {
            Some(held) if held.id == lease.id() => {
                held.expires_at = Instant::now() + lease.duration();
                Ok(())
            }
            _ => Err(StoreError::LeaseMismatch {
                path: lease.path().to_string(),
            }),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.state();
        if state
            .leases
            .get(lease.path())
            .is_some_and(|held| held.id == lease.id())
        {
            state.leases.remove(lease.path());
        }
        Ok(())
    }
}
