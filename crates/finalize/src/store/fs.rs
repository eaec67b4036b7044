//! Local-directory blob store.
//!
//! Blobs live at `<root>/<container>/<key>`. Each leased key gets a directory
//! under `<root>/.leases/<container>/` holding numbered generation files; the
//! highest generation is the current lease record. A generation file is only
//! ever created with `hard_link`, which fails when the file already exists, so
//! two callers taking over the same expired generation cannot both succeed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BlobStore, Lease};
use crate::error::StoreError;

const LEASE_SUFFIX: &str = ".lease";

// Attempts at reading the newest generation while older ones are pruned
const READ_ATTEMPTS: usize = 3;

/// On-disk lease record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    lease_id: Uuid,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn for_lease(lease: &Lease) -> Self {
        let ttl = chrono::Duration::from_std(lease.duration())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            lease_id: lease.id(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Record written on release: held by nobody, already expired
    fn released() -> Self {
        Self {
            lease_id: Uuid::nil(),
            expires_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Blob store backed by a directory tree.
pub struct FsBlobStore {
    container: String,
    container_dir: PathBuf,
    lease_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store for `container` rooted at `root`.
    pub fn new(root: impl AsRef<Path>, container: impl Into<String>) -> Self {
        let root = root.as_ref();
        let container = container.into();
        Self {
            container_dir: root.join(&container),
            lease_dir: root.join(".leases").join(&container),
            container,
        }
    }

    /// Directory holding this container's blobs
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.container_dir.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(StoreError::Backend(format!(
                    "blob key may not contain relative segments: {key}"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn lease_slot(&self, key: &str) -> PathBuf {
        self.lease_dir.join(key.trim_matches('/').replace('/', "__"))
    }

    fn generation_path(slot: &Path, generation: u64) -> PathBuf {
        slot.join(format!("{generation:020}{LEASE_SUFFIX}"))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent.display().to_string(), e))?;
        }
        Ok(())
    }

    /// Generation numbers present in a lease slot, ascending.
    async fn generations(slot: &Path) -> Result<Vec<u64>, StoreError> {
        let mut entries = match fs::read_dir(slot).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(slot.display().to_string(), e)),
        };

        let mut generations = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(slot.display().to_string(), e))?
        {
            let name = entry.file_name();
            let parsed = name
                .to_str()
                .and_then(|name| name.strip_suffix(LEASE_SUFFIX))
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(generation) = parsed {
                generations.push(generation);
            }
        }
        generations.sort_unstable();
        Ok(generations)
    }

    /// Newest lease generation for `key` and its record.
    async fn current(&self, key: &str) -> Result<Option<(u64, LeaseRecord)>, StoreError> {
        let slot = self.lease_slot(key);

        for _ in 0..READ_ATTEMPTS {
            let Some(&generation) = Self::generations(&slot).await?.last() else {
                return Ok(None);
            };
            let path = Self::generation_path(&slot, generation);
            match fs::read_to_string(&path).await {
                Ok(raw) => {
                    let record = serde_json::from_str::<LeaseRecord>(&raw).unwrap_or_else(|e| {
                        warn!(path = %path.display(), error = %e, "Unreadable lease record, treating as expired");
                        LeaseRecord::released()
                    });
                    return Ok(Some((generation, record)));
                }
                // Pruned after a newer generation appeared; look again
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path.display().to_string(), e)),
            }
        }

        Err(StoreError::Backend(format!(
            "lease generations for {key} kept changing while being read"
        )))
    }

    /// Write `record` to a unique temp file inside the slot.
    async fn stage_record(slot: &Path, record: &LeaseRecord) -> Result<PathBuf, StoreError> {
        let staged = slot.join(format!("{}.tmp", Uuid::new_v4()));
        Self::ensure_parent(&staged).await?;
        let body = serde_json::to_string(record)?;
        fs::write(&staged, body)
            .await
            .map_err(|e| StoreError::io(staged.display().to_string(), e))?;
        Ok(staged)
    }

    /// Create generation `generation` holding `record`.
    ///
    /// Returns `false` if that generation already exists.
    async fn publish(
        &self,
        key: &str,
        generation: u64,
        record: &LeaseRecord,
    ) -> Result<bool, StoreError> {
        let slot = self.lease_slot(key);
        let staged = Self::stage_record(&slot, record).await?;
        let target = Self::generation_path(&slot, generation);

        let linked = match fs::hard_link(&staged, &target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(target.display().to_string(), e)),
        };
        let _ = fs::remove_file(&staged).await;

        if matches!(linked, Ok(true)) {
            Self::prune(&slot, generation).await;
        }
        linked
    }

    /// Best-effort removal of generations older than `newest`.
    async fn prune(slot: &Path, newest: u64) {
        let Ok(generations) = Self::generations(slot).await else {
            return;
        };
        for generation in generations.into_iter().filter(|g| *g < newest) {
            let _ = fs::remove_file(Self::generation_path(slot, generation)).await;
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.container_dir.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(dir.display().to_string(), e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if key_prefix.is_empty() {
                    name
                } else {
                    format!("{key_prefix}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(entry.path().display().to_string(), e))?;

                if file_type.is_dir() {
                    // Only descend where the prefix can still match
                    if prefix.starts_with(&key) || key.starts_with(prefix) {
                        pending.push((entry.path(), key));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<(), StoreError> {
        let from = self.blob_path(source)?;
        let to = self.blob_path(dest)?;
        Self::ensure_parent(&to).await?;
        match fs::copy(&from, &to).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                path: source.to_string(),
            }),
            Err(e) => Err(StoreError::io(dest, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let target = self.blob_path(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn put_string(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let target = self.blob_path(path)?;
        Self::ensure_parent(&target).await?;
        fs::write(&target, content)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn try_acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        if fs::metadata(self.blob_path(path)?).await.is_err() {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }

        let next = match self.current(path).await? {
            None => 0,
            Some((_, record)) if !record.is_expired() => {
                debug!(path = %path, "Lease held by another holder");
                return Ok(None);
            }
            Some((generation, _)) => generation + 1,
        };

        let lease = Lease::new(path, duration);
        if self.publish(path, next, &LeaseRecord::for_lease(&lease)).await? {
            Ok(Some(lease))
        } else {
            debug!(path = %path, generation = next, "Lost lease race to another holder");
            Ok(None)
        }
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mismatch = || StoreError::LeaseMismatch {
            path: lease.path().to_string(),
        };

        // An expired record may already be in the middle of a takeover
        let generation = match self.current(lease.path()).await? {
            Some((generation, record))
                if record.lease_id == lease.id() && !record.is_expired() =>
            {
                generation
            }
            _ => return Err(mismatch()),
        };

        let slot = self.lease_slot(lease.path());
        let staged = Self::stage_record(&slot, &LeaseRecord::for_lease(lease)).await?;
        let target = Self::generation_path(&slot, generation);
        fs::rename(&staged, &target)
            .await
            .map_err(|e| StoreError::io(target.display().to_string(), e))?;

        match self.current(lease.path()).await? {
            Some((current, record)) if current == generation && record.lease_id == lease.id() => {
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        match self.current(lease.path()).await? {
            Some((generation, record)) if record.lease_id == lease.id() => {
                if !self
                    .publish(lease.path(), generation + 1, &LeaseRecord::released())
                    .await?
                {
                    debug!(path = %lease.path(), "Lease already moved on, nothing to release");
                }
                Ok(())
            }
            _ => {
                debug!(path = %lease.path(), "Lease not held, nothing to release");
                Ok(())
            }
        }
    }
}
