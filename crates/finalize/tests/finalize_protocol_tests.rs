//! End-to-end tests for the finalization protocol against in-memory and
//! filesystem stores.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use finalize::{
    BlobStore, BuildLogger, FinalizeConfig, FinalizeError, FinalizeOutcome, Finalizer,
    FsBlobStore, Lease, LeaseConfig, MemoryBlobStore, StoreError,
};

const SEMAPHORE: &str = "locks/finalize.semaphore";

fn config(version: &str) -> FinalizeConfig {
    FinalizeConfig {
        semaphore_blob: SEMAPHORE.to_string(),
        finalize_container: "dev/Finalized".to_string(),
        container_name: "builds".to_string(),
        channel: "dev".to_string(),
        version: version.to_string(),
        publish_rids: vec!["win-x64".to_string(), "linux-x64".to_string()],
        commit_hash: Some("0123abcd".to_string()),
        force_publish: false,
        lease: LeaseConfig {
            max_wait_secs: 10,
            delay_ms: 5,
            duration_secs: 60,
        },
    }
}

/// Logger that keeps every message for inspection
#[derive(Default)]
struct RecordingLogger {
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingLogger {
    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }
}

impl BuildLogger for RecordingLogger {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

/// Store wrapper that records copies and injects failures
struct FaultyStore {
    inner: Arc<MemoryBlobStore>,
    fail_copies_containing: Vec<String>,
    fail_deletes_containing: Vec<String>,
    fail_puts_containing: Vec<String>,
    fail_list_prefix: Option<String>,
    refuse_renewals: bool,
    refuse_releases: bool,
    copy_delay: Duration,
    copies: Mutex<Vec<String>>,
}

impl FaultyStore {
    fn new(inner: Arc<MemoryBlobStore>) -> Self {
        Self {
            inner,
            fail_copies_containing: Vec::new(),
            fail_deletes_containing: Vec::new(),
            fail_puts_containing: Vec::new(),
            fail_list_prefix: None,
            refuse_renewals: false,
            refuse_releases: false,
            copy_delay: Duration::ZERO,
            copies: Mutex::new(Vec::new()),
        }
    }

    fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }
}

fn matches_any(needles: &[String], key: &str) -> bool {
    needles.iter().any(|needle| key.contains(needle.as_str()))
}

#[async_trait]
impl BlobStore for FaultyStore {
    fn container(&self) -> &str {
        self.inner.container()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if self.fail_list_prefix.as_deref() == Some(prefix) {
            return Err(StoreError::Backend(format!("listing {prefix} refused")));
        }
        self.inner.list(prefix).await
    }

    async fn copy(&self, source: &str, dest: &str) -> Result<(), StoreError> {
        self.copies.lock().unwrap().push(source.to_string());
        if !self.copy_delay.is_zero() {
            tokio::time::sleep(self.copy_delay).await;
        }
        if matches_any(&self.fail_copies_containing, source) {
            return Err(StoreError::Backend(format!("copy of {source} refused")));
        }
        self.inner.copy(source, dest).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if matches_any(&self.fail_deletes_containing, path) {
            return Err(StoreError::Backend(format!("delete of {path} refused")));
        }
        self.inner.delete(path).await
    }

    async fn put_string(&self, path: &str, content: &str) -> Result<(), StoreError> {
        if matches_any(&self.fail_puts_containing, path) {
            return Err(StoreError::Backend(format!("upload of {path} refused")));
        }
        self.inner.put_string(path, content).await
    }

    async fn try_acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        self.inner.try_acquire_lease(path, duration).await
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        if self.refuse_renewals {
            return Err(StoreError::Backend("renewal refused".to_string()));
        }
        self.inner.renew_lease(lease).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        if self.refuse_releases {
            return Err(StoreError::Backend("release refused".to_string()));
        }
        self.inner.release_lease(lease).await
    }
}

fn seeded_store(version: &str) -> Arc<MemoryBlobStore> {
    let store = Arc::new(MemoryBlobStore::new("builds"));
    seed_build(&store, version);
    store
}

fn seed_build(store: &MemoryBlobStore, version: &str) {
    store.insert(
        format!("dev/Binaries/{version}/runtime-{version}-win-x64.zip"),
        format!("runtime {version}"),
    );
    store.insert(
        format!("dev/Binaries/{version}/runtime-{version}-linux-x64.tar.gz"),
        format!("runtime {version}"),
    );
    store.insert(
        format!("dev/Installers/{version}/installer-{version}.exe"),
        format!("installer {version}"),
    );
}

#[tokio::test]
async fn test_promotes_build_to_latest() {
    let store = seeded_store("1.2.3-preview-4-5");
    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(store.clone(), config("1.2.3-preview-4-5"), logger.clone());

    assert!(finalizer.execute().await);
    assert!(logger.errors().is_empty());

    assert_eq!(
        store.get("dev/Binaries/Latest/runtime-Latest-win-x64.zip").as_deref(),
        Some("runtime 1.2.3-preview-4-5")
    );
    assert_eq!(
        store.get("dev/Binaries/Latest/runtime-Latest-linux-x64.tar.gz").as_deref(),
        Some("runtime 1.2.3-preview-4-5")
    );
    assert_eq!(
        store.get("dev/Installers/Latest/installer-Latest.exe").as_deref(),
        Some("installer 1.2.3-preview-4-5")
    );
    assert_eq!(
        store.get("dev/dnvm/latest.sharedfx.win-x64.version").as_deref(),
        Some("0123abcd\n1.2.3-preview-4-5\n")
    );
    assert_eq!(
        store.get("dev/dnvm/latest.sharedfx.linux-x64.version").as_deref(),
        Some("0123abcd\n1.2.3-preview-4-5\n")
    );
    assert!(store.get("dev/Finalized/1.2.3-preview-4-5").is_some());
    assert!(!store.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_stamp_without_commit_hash() {
    let store = seeded_store("2.0.0");
    let mut config = config("2.0.0");
    config.commit_hash = None;

    let finalizer = Finalizer::new(store.clone(), config, Arc::new(RecordingLogger::default()));
    assert!(finalizer.execute().await);
    assert_eq!(
        store.get("dev/dnvm/latest.sharedfx.win-x64.version").as_deref(),
        Some("2.0.0\n")
    );
}

#[tokio::test]
async fn test_second_run_is_skipped() {
    let store = seeded_store("1.2.3");
    let first = Finalizer::new(store.clone(), config("1.2.3"), Arc::new(RecordingLogger::default()));
    assert!(first.execute().await);

    // Anything copied by a second run would show up here
    store.delete("dev/Installers/Latest/installer-Latest.exe").await.unwrap();

    let logger = Arc::new(RecordingLogger::default());
    let second = Finalizer::new(store.clone(), config("1.2.3"), logger.clone());
    let outcome = second.run().await.unwrap();

    assert_eq!(
        outcome,
        FinalizeOutcome::Skipped {
            version: "1.2.3".to_string()
        }
    );
    assert!(store.get("dev/Installers/Latest/installer-Latest.exe").is_none());
    assert!(logger.infos().iter().any(|m| m.contains("already finalized")));
    assert!(!store.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_force_publish_overrides_marker() {
    let store = seeded_store("1.2.3");
    store.insert("dev/Finalized/1.2.3", "2026-01-01T00:00:00+00:00");

    let mut config = config("1.2.3");
    config.force_publish = true;
    let outcome = Finalizer::new(store.clone(), config, Arc::new(RecordingLogger::default()))
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome, FinalizeOutcome::Promoted(_)));
    assert!(outcome.succeeded());
    assert!(store.get("dev/Installers/Latest/installer-Latest.exe").is_some());
    assert!(store.get("dev/Finalized/1.2.3").is_some());
}

#[tokio::test]
async fn test_purges_only_bare_version_markers() {
    let store = seeded_store("2.0.0");
    for marker in [
        "dev/Finalized/1.2.3",
        "dev/Finalized/1.2.3-preview-4-5",
        "dev/Finalized/notaversion.txt",
        "dev/Finalized/1.2.3.json",
    ] {
        store.insert(marker, "");
    }

    let outcome = Finalizer::new(store.clone(), config("2.0.0"), Arc::new(RecordingLogger::default()))
        .run()
        .await
        .unwrap();

    let FinalizeOutcome::Promoted(report) = outcome else {
        panic!("expected a promotion");
    };
    assert_eq!(
        report.purge.deleted,
        vec!["dev/Finalized/1.2.3", "dev/Finalized/1.2.3-preview-4-5"]
    );

    let markers: Vec<String> = store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("dev/Finalized/"))
        .collect();
    assert_eq!(
        markers,
        vec![
            "dev/Finalized/1.2.3.json",
            "dev/Finalized/2.0.0",
            "dev/Finalized/notaversion.txt",
        ]
    );
}

#[tokio::test]
async fn test_partial_copy_failure_fails_run() {
    let inner = Arc::new(MemoryBlobStore::new("builds"));
    for i in 0..10 {
        inner.insert(format!("dev/Binaries/3.0.0/part{i}-3.0.0.bin"), format!("{i}"));
    }
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.fail_copies_containing = vec!["part2-".into(), "part5-".into(), "part7-".into()];
    let store = Arc::new(faulty);

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(store.clone(), config("3.0.0"), logger.clone());
    let outcome = finalizer.run().await.unwrap();

    let FinalizeOutcome::Promoted(report) = &outcome else {
        panic!("expected a promotion");
    };
    let binaries = &report.batches[0];
    assert_eq!(binaries.folder, "Binaries");
    assert!(!binaries.succeeded());
    assert_eq!(binaries.results.len(), 10);
    assert_eq!(binaries.failures().count(), 3);
    assert!(!outcome.succeeded());

    // Every non-failing copy still landed
    let latest: Vec<String> = inner
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("dev/Binaries/Latest/"))
        .collect();
    assert_eq!(latest.len(), 7);
    assert!(latest.contains(&"dev/Binaries/Latest/part0-Latest.bin".to_string()));
    assert!(!latest.contains(&"dev/Binaries/Latest/part2-Latest.bin".to_string()));

    assert_eq!(logger.error_count(), 3);
    assert!(!inner.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_logged_error_fails_execute() {
    let inner = seeded_store("3.1.0");
    let mut faulty = FaultyStore::new(inner);
    faulty.fail_copies_containing = vec!["installer-".into()];

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(Arc::new(faulty), config("3.1.0"), logger.clone());

    assert!(!finalizer.execute().await);
    assert!(logger.errors().iter().any(|m| m.contains("installer-3.1.0.exe")));
}

#[tokio::test]
async fn test_store_failure_releases_lease() {
    let inner = seeded_store("4.0.0");
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.fail_list_prefix = Some("dev/Installers/4.0.0/".to_string());

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(Arc::new(faulty), config("4.0.0"), logger.clone());

    let err = finalizer.run().await.unwrap_err();
    assert!(matches!(err, FinalizeError::Store(StoreError::Backend(_))));
    assert!(!inner.is_leased(SEMAPHORE));

    assert!(!finalizer.execute().await);
    assert!(logger.errors().iter().any(|m| m.contains("Finalization failed")));
    assert!(!inner.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_times_out_while_lease_held_elsewhere() {
    let store = seeded_store("5.0.0");
    store.insert(SEMAPHORE, "");
    let foreign = store
        .try_acquire_lease(SEMAPHORE, Duration::from_secs(60))
        .await
        .unwrap()
        .expect("lease should be free");

    let mut config = config("5.0.0");
    config.lease.max_wait_secs = 0;
    let finalizer = Finalizer::new(store.clone(), config, Arc::new(RecordingLogger::default()));

    assert!(matches!(
        finalizer.run().await,
        Err(FinalizeError::LeaseTimeout { .. })
    ));
    assert!(store.get("dev/Finalized/5.0.0").is_none());
    assert!(store.get("dev/Installers/Latest/installer-Latest.exe").is_none());

    // The foreign holder still owns the lease
    assert!(store.is_leased(SEMAPHORE));
    store.release_lease(&foreign).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_runs_do_not_interleave() {
    let inner = Arc::new(MemoryBlobStore::new("builds"));
    seed_build(&inner, "6.0.0");
    seed_build(&inner, "6.1.0");

    let mut faulty = FaultyStore::new(inner.clone());
    faulty.copy_delay = Duration::from_millis(10);
    let store = Arc::new(faulty);

    let runs: Vec<_> = ["6.0.0", "6.1.0"]
        .into_iter()
        .map(|version| {
            let finalizer = Finalizer::new(
                store.clone(),
                config(version),
                Arc::new(RecordingLogger::default()),
            );
            tokio::spawn(async move { finalizer.execute().await })
        })
        .collect();
    for run in runs {
        assert!(run.await.unwrap());
    }

    let versions: Vec<&str> = store
        .copies()
        .iter()
        .map(|source| {
            if source.contains("/6.0.0/") {
                "6.0.0"
            } else {
                "6.1.0"
            }
        })
        .collect();
    assert_eq!(versions.len(), 6);
    let switches = versions.windows(2).filter(|w| w[0] != w[1]).count();
    assert_eq!(switches, 1, "copies interleaved: {versions:?}");

    // The later run owns Latest and only its marker survives
    let winner = versions[5];
    assert_eq!(
        inner.get("dev/Installers/Latest/installer-Latest.exe"),
        Some(format!("installer {winner}"))
    );
    let loser = versions[0];
    assert!(inner.get(&format!("dev/Finalized/{winner}")).is_some());
    assert!(inner.get(&format!("dev/Finalized/{loser}")).is_none());
    assert!(!inner.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_filesystem_store_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FsBlobStore::new(dir.path(), "builds"));
    store
        .put_string("dev/Binaries/7.0.0/tool-7.0.0.zip", "tool")
        .await
        .unwrap();
    store
        .put_string("dev/Finalized/6.9.9", "")
        .await
        .unwrap();

    let finalizer = Finalizer::new(store.clone(), config("7.0.0"), Arc::new(RecordingLogger::default()));
    assert!(finalizer.execute().await);

    let root = dir.path().join("builds");
    assert_eq!(
        std::fs::read_to_string(root.join("dev/Binaries/Latest/tool-Latest.zip")).unwrap(),
        "tool"
    );
    assert!(root.join(SEMAPHORE).exists());
    assert!(root.join("dev/Finalized/7.0.0").exists());
    assert!(!root.join("dev/Finalized/6.9.9").exists());

    // A second run sees the marker and skips
    let again = Finalizer::new(store, config("7.0.0"), Arc::new(RecordingLogger::default()));
    assert!(matches!(
        again.run().await.unwrap(),
        FinalizeOutcome::Skipped { .. }
    ));
}

#[tokio::test]
async fn test_untagged_prerelease_version() {
    let store = seeded_store("1.2.3-4-5");
    store.insert("dev/Finalized/1.2.2-4-1", "");

    let finalizer = Finalizer::new(store.clone(), config("1.2.3-4-5"), Arc::new(RecordingLogger::default()));
    assert!(finalizer.execute().await);

    assert_eq!(
        store.get("dev/Binaries/Latest/runtime-Latest-win-x64.zip").as_deref(),
        Some("runtime 1.2.3-4-5")
    );
    assert!(store.get("dev/Installers/Latest/installer-Latest.exe").is_some());
    assert!(store.get("dev/Finalized/1.2.2-4-1").is_none());
    assert!(store.get("dev/Finalized/1.2.3-4-5").is_some());
}

#[tokio::test]
async fn test_failed_marker_delete_is_tolerated() {
    let inner = seeded_store("2.1.0");
    inner.insert("dev/Finalized/1.0.0", "");
    inner.insert("dev/Finalized/1.1.0", "");
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.fail_deletes_containing = vec!["Finalized/1.0.0".into()];

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(Arc::new(faulty), config("2.1.0"), logger.clone());
    let outcome = finalizer.run().await.unwrap();

    let FinalizeOutcome::Promoted(report) = &outcome else {
        panic!("expected a promotion");
    };
    assert_eq!(report.purge.failed, vec!["dev/Finalized/1.0.0"]);
    assert_eq!(report.purge.deleted, vec!["dev/Finalized/1.1.0"]);
    assert!(outcome.succeeded());
    assert!(logger.errors().is_empty());
    assert_eq!(logger.warnings.lock().unwrap().len(), 1);

    // The rest of promotion still ran
    assert!(inner.get("dev/Installers/Latest/installer-Latest.exe").is_some());
    assert!(inner.get("dev/Finalized/1.0.0").is_some());
}

#[tokio::test]
async fn test_failed_stamp_fails_run() {
    let inner = seeded_store("2.2.0");
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.fail_puts_containing = vec!["sharedfx.linux-x64".into()];

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(Arc::new(faulty), config("2.2.0"), logger.clone());
    let outcome = finalizer.run().await.unwrap();

    let FinalizeOutcome::Promoted(report) = &outcome else {
        panic!("expected a promotion");
    };
    assert_eq!(report.stamps, vec!["dev/dnvm/latest.sharedfx.win-x64.version"]);
    assert_eq!(report.failed_stamps, vec!["dev/dnvm/latest.sharedfx.linux-x64.version"]);
    assert!(!outcome.succeeded());
    assert_eq!(logger.error_count(), 1);
    assert!(inner.get("dev/dnvm/latest.sharedfx.win-x64.version").is_some());
    assert!(!inner.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_failed_release_is_logged_not_raised() {
    let inner = seeded_store("2.3.0");
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.refuse_releases = true;

    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(Arc::new(faulty), config("2.3.0"), logger.clone());

    assert!(finalizer.execute().await);
    assert!(logger.errors().is_empty());
    assert!(inner.get("dev/Finalized/2.3.0").is_some());

    // The refused release leaves the lease to expire on its own
    assert!(inner.is_leased(SEMAPHORE));
}

#[tokio::test]
async fn test_lost_lease_stops_promotion() {
    let inner = seeded_store("2.4.0");
    let mut faulty = FaultyStore::new(inner.clone());
    faulty.refuse_renewals = true;
    faulty.copy_delay = Duration::from_millis(2_500);
    let store = Arc::new(faulty);

    let mut config = config("2.4.0");
    config.lease.duration_secs = 1;
    let logger = Arc::new(RecordingLogger::default());
    let finalizer = Finalizer::new(store.clone(), config, logger.clone());

    assert!(!finalizer.execute().await);
    assert!(logger
        .errors()
        .iter()
        .any(|m| m.contains("Lost lease on locks/finalize.semaphore")));

    // Promotion was abandoned before any copy finished
    assert!(inner.get("dev/Binaries/Latest/runtime-Latest-win-x64.zip").is_none());
    assert!(inner.get("dev/dnvm/latest.sharedfx.win-x64.version").is_none());
    assert!(!inner.is_leased(SEMAPHORE));
}
