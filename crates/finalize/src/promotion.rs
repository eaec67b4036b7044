//! Promotion engine: makes a channel's `Latest` view reflect one version.
//!
//! Runs only while the semaphore lease is held; nothing in here locks.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::config::FinalizeConfig;
use crate::error::{FinalizeResult, StoreError};
use crate::gate::VersionGate;
use crate::logger::BuildLogger;
use crate::store::{blob_name, file_name, join_key, BlobStore};
use crate::version::{is_bare_version, latest_name, LATEST_TOKEN};

/// Artifact folders promoted to `Latest`, in order
pub const PROMOTED_FOLDERS: [&str; 2] = ["Binaries", "Installers"];

/// Outcome of copying one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub source: String,
    pub destination: String,
    /// Failure message, `None` on success
    pub error: Option<String>,
}

impl CopyResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Every copy dispatched for one folder, in dispatch order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub folder: String,
    pub results: Vec<CopyResult>,
}

impl BatchOutcome {
    /// Logical AND of every copy in the batch
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(CopyResult::succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CopyResult> {
        self.results.iter().filter(|r| !r.succeeded())
    }
}

/// Stale markers removed before promotion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Everything one promotion did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub purge: PurgeOutcome,
    pub batches: Vec<BatchOutcome>,
    pub stamps: Vec<String>,
    pub failed_stamps: Vec<String>,
}

impl PromotionReport {
    /// True when every copy and every stamp went through.
    ///
    /// Purge failures are tolerated and do not count.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.batches.iter().all(BatchOutcome::succeeded) && self.failed_stamps.is_empty()
    }
}

/// Body of a shared-framework stamp file: `[commit\n]version\n`.
#[must_use]
pub fn stamp_content(commit_hash: Option<&str>, version: &str) -> String {
    match commit_hash {
        Some(commit) => format!("{commit}\n{version}\n"),
        None => format!("{version}\n"),
    }
}

/// Copies one version's artifacts to `Latest` and writes stamp files.
pub struct PromotionEngine {
    store: Arc<dyn BlobStore>,
    gate: VersionGate,
    logger: Arc<dyn BuildLogger>,
    finalize_container: String,
    channel: String,
    version: String,
    publish_rids: Vec<String>,
    commit_hash: Option<String>,
}

impl PromotionEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        gate: VersionGate,
        logger: Arc<dyn BuildLogger>,
        config: &FinalizeConfig,
    ) -> Self {
        Self {
            store,
            gate,
            logger,
            finalize_container: config.finalize_container.clone(),
            channel: config.channel.clone(),
            version: config.version.clone(),
            publish_rids: config.publish_rids.clone(),
            commit_hash: config.commit_hash.clone(),
        }
    }

    /// Run every promotion step in order.
    pub async fn promote(&self) -> FinalizeResult<PromotionReport> {
        info!(channel = %self.channel, version = %self.version, "Promoting version to latest");

        let purge = self.purge_stale_markers().await?;
        self.gate.ensure_marker_exists(&self.version).await?;

        let mut batches = Vec::with_capacity(PROMOTED_FOLDERS.len());
        for folder in PROMOTED_FOLDERS {
            batches.push(self.copy_to_latest(folder).await?);
        }

        let (stamps, failed_stamps) = self.publish_stamps().await;

        let report = PromotionReport {
            purge,
            batches,
            stamps,
            failed_stamps,
        };
        info!(
            version = %self.version,
            succeeded = report.succeeded(),
            "Promotion finished"
        );
        Ok(report)
    }

    /// Delete marker blobs whose file name is nothing but a version.
    ///
    /// Individual delete failures are logged and skipped.
    pub async fn purge_stale_markers(&self) -> Result<PurgeOutcome, StoreError> {
        let prefix = format!("{}/", self.finalize_container.trim_end_matches('/'));
        let container = self.store.container().to_string();

        let mut outcome = PurgeOutcome::default();
        for listed in self.store.list(&prefix).await? {
            let key = blob_name(&listed, &container);
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if name.contains('/') || !is_bare_version(name) {
                continue;
            }

            match self.store.delete(key).await {
                Ok(()) => {
                    debug!(key = %key, "Deleted stale marker");
                    outcome.deleted.push(key.to_string());
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("Failed to delete stale marker {key}: {e}"));
                    outcome.failed.push(key.to_string());
                }
            }
        }
        Ok(outcome)
    }

    /// Copy every blob of `<channel>/<folder>/<version>/` to
    /// `<channel>/<folder>/Latest/`, renaming the version to `Latest`.
    ///
    /// All copies run concurrently; each result is kept.
    pub async fn copy_to_latest(&self, folder: &str) -> Result<BatchOutcome, StoreError> {
        let source_prefix = format!("{}/{folder}/{}/", self.channel, self.version);
        let latest_prefix = format!("{}/{folder}/{LATEST_TOKEN}", self.channel);
        let container = self.store.container().to_string();

        let plan: Vec<(String, String)> = self
            .store
            .list(&source_prefix)
            .await?
            .iter()
            .map(|listed| {
                let source = blob_name(listed, &container).to_string();
                let destination = join_key(&latest_prefix, &latest_name(file_name(&source)));
                (source, destination)
            })
            .collect();

        debug!(folder = %folder, count = plan.len(), "Dispatching copies");

        let copies = plan.into_iter().map(|(source, destination)| {
            let store = Arc::clone(&self.store);
            async move {
                let error = store
                    .copy(&source, &destination)
                    .await
                    .err()
                    .map(|e| e.to_string());
                CopyResult {
                    source,
                    destination,
                    error,
                }
            }
        });
        let results = join_all(copies).await;

        let outcome = BatchOutcome {
            folder: folder.to_string(),
            results,
        };
        for failed in outcome.failures() {
            self.logger.error(&format!(
                "Failed to copy {} to {}: {}",
                failed.source,
                failed.destination,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }
        info!(
            folder = %folder,
            copied = outcome.results.len() - outcome.failures().count(),
            failed = outcome.failures().count(),
            "Copy batch complete"
        );
        Ok(outcome)
    }

    /// Write `<channel>/dnvm/latest.sharedfx.<rid>.version` for every rid.
    ///
    /// Returns `(published, failed)` keys.
    pub async fn publish_stamps(&self) -> (Vec<String>, Vec<String>) {
        let body = stamp_content(self.commit_hash.as_deref(), &self.version);
        let mut published = Vec::new();
        let mut failed = Vec::new();

        for rid in &self.publish_rids {
            let stamp_file = format!("{rid}.version");
            let key = format!("{}/dnvm/latest.sharedfx.{stamp_file}", self.channel);

            match self.store.put_string(&key, &body).await {
                Ok(()) => {
                    debug!(key = %key, "Published version stamp");
                    published.push(key);
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Failed to publish version stamp {key}: {e}"));
                    failed.push(key);
                }
            }
        }
        (published, failed)
    }
}
