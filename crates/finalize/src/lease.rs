//! # Semaphore Lease
//!
//! Serializes finalization across concurrent pipelines by holding an exclusive
//! lease on a single semaphore blob. Acquisition retries with a fixed delay
//! until a maximum wait elapses; a held lease is renewed in the background
//! until it is released.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{FinalizeError, FinalizeResult};
use crate::store::{BlobStore, Lease};

/// Default upper bound on time spent waiting for the lease
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Default pause between acquisition attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default validity of a lease between renewals
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(10);

/// Timing knobs for lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Give up acquiring after this long
    pub max_wait: Duration,
    /// Sleep between attempts
    pub delay: Duration,
    /// Lease validity; renewed every half period
    pub duration: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            delay: DEFAULT_RETRY_DELAY,
            duration: DEFAULT_LEASE_DURATION,
        }
    }
}

/// Acquires and releases the lease on one semaphore blob.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn BlobStore>,
    path: String,
    settings: LeaseSettings,
}

impl LeaseManager {
    /// Create a manager for the semaphore blob at `path`.
    pub fn new(store: Arc<dyn BlobStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            settings: LeaseSettings::default(),
        }
    }

    /// Override the default timing
    #[must_use]
    pub fn with_settings(mut self, settings: LeaseSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Semaphore blob path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Block until the lease is held or `max_wait` has elapsed.
    pub async fn acquire(&self) -> FinalizeResult<ActiveLease> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(lease) = self
                .store
                .try_acquire_lease(&self.path, self.settings.duration)
                .await?
            {
                info!(
                    path = %self.path,
                    lease_id = %lease.id(),
                    attempts,
                    "Acquired semaphore lease"
                );
                return Ok(ActiveLease::new(lease, Arc::clone(&self.store)));
            }

            let waited = started.elapsed();
            if waited >= self.settings.max_wait {
                warn!(
                    path = %self.path,
                    attempts,
                    waited_ms = waited.as_millis() as u64,
                    "Gave up waiting for semaphore lease"
                );
                return Err(FinalizeError::LeaseTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            debug!(path = %self.path, attempts, "Semaphore lease busy, retrying");
            let remaining = self.settings.max_wait - waited;
            tokio::time::sleep(self.settings.delay.min(remaining)).await;
        }
    }

    /// Release `lease` if one is held; `None` is a no-op.
    pub async fn release(&self, lease: Option<ActiveLease>) {
        match lease {
            Some(lease) => lease.release().await,
            None => debug!(path = %self.path, "No lease held, nothing to release"),
        }
    }

    /// Run `work` while holding the lease.
    ///
    /// The lease is released whether `work` succeeds, returns an error, or
    /// panics; a panic is resumed after the release. If a renewal fails,
    /// `work` is dropped at its next await point and the call returns
    /// [`FinalizeError::LeaseLost`].
    pub async fn with_lease<F, Fut, T>(&self, work: F) -> FinalizeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FinalizeResult<T>>,
    {
        let lease = self.acquire().await?;
        let mut lost = lease.lost_signal();

        let mut work = Box::pin(AssertUnwindSafe(work()).catch_unwind());
        let outcome = tokio::select! {
            outcome = &mut work => Some(outcome),
            Ok(_) = lost.wait_for(Option::is_some) => None,
        };
        drop(work);
        let reason = lost.borrow().clone();
        self.release(Some(lease)).await;

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => Err(FinalizeError::LeaseLost {
                path: self.path.clone(),
                reason: reason.unwrap_or_else(|| "renewal stopped".to_string()),
            }),
        }
    }
}

/// A held lease, renewed in the background until released or dropped.
pub struct ActiveLease {
    lease: Lease,
    store: Arc<dyn BlobStore>,
    renewal_handle: Option<tokio::task::JoinHandle<()>>,
    lost: watch::Receiver<Option<String>>,
    released: bool,
}

impl ActiveLease {
    fn new(lease: Lease, store: Arc<dyn BlobStore>) -> Self {
        let (lost_tx, lost) = watch::channel(None);
        let mut active = Self {
            lease,
            store,
            renewal_handle: None,
            lost,
            released: false,
        };
        active.start_renewal(lost_tx);
        active
    }

    fn start_renewal(&mut self, lost_tx: watch::Sender<Option<String>>) {
        let store = Arc::clone(&self.store);
        let lease = self.lease.clone();
        let period = (lease.duration() / 2).max(MIN_RENEWAL_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                interval.tick().await;

                match store.renew_lease(&lease).await {
                    Ok(()) => {
                        debug!(path = %lease.path(), lease_id = %lease.id(), "Lease renewed");
                    }
                    Err(e) => {
                        error!(
                            path = %lease.path(),
                            lease_id = %lease.id(),
                            error = %e,
                            "Failed to renew lease, lease may expire"
                        );
                        lost_tx.send_replace(Some(e.to_string()));
                        break;
                    }
                }
            }
        });

        self.renewal_handle = Some(handle);
    }

    /// The underlying lease
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Whether renewal has failed and the lease can no longer be trusted
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.borrow().is_some()
    }

    /// Receiver that turns `Some(reason)` when renewal fails
    #[must_use]
    pub fn lost_signal(&self) -> watch::Receiver<Option<String>> {
        self.lost.clone()
    }

    /// Stop renewing and give the lease back. Release failures are logged.
    pub async fn release(mut self) {
        if let Some(handle) = self.renewal_handle.take() {
            handle.abort();
        }

        match self.store.release_lease(&self.lease).await {
            Ok(()) => {
                info!(path = %self.lease.path(), lease_id = %self.lease.id(), "Released semaphore lease");
            }
            Err(e) => {
                warn!(
                    path = %self.lease.path(),
                    lease_id = %self.lease.id(),
                    error = %e,
                    "Failed to release semaphore lease; it will expire on its own"
                );
            }
        }
        self.released = true;
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal_handle.take() {
            handle.abort();
        }
        if self.released {
            return;
        }

        // Dropped without release (cancelled task): give it back in the background
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let lease = self.lease.clone();
            runtime.spawn(async move {
                if let Err(e) = store.release_lease(&lease).await {
                    warn!(path = %lease.path(), error = %e, "Failed to release dropped lease");
                }
            });
        }
    }
}
