//! Host logging capability.
//!
//! The build host decides whether a run failed partly from what was logged:
//! anything reported through [`BuildLogger::error`] turns the overall result
//! into a failure even if every step returned normally.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, info, warn};

/// Logging channel supplied by whatever invokes the finalizer.
pub trait BuildLogger: Send + Sync {
    /// Informational progress message
    fn info(&self, message: &str);

    /// Tolerated problem
    fn warn(&self, message: &str);

    /// Problem that fails the run
    fn error(&self, message: &str);

    /// Number of errors reported so far
    fn error_count(&self) -> usize;

    /// Whether any error has been reported
    fn has_logged_errors(&self) -> bool {
        self.error_count() > 0
    }
}

/// [`BuildLogger`] that forwards to `tracing` and counts errors.
#[derive(Debug, Default)]
pub struct TracingLogger {
    errors: AtomicUsize,
}

impl TracingLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildLogger for TracingLogger {
    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
    }

    fn error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        error!("{message}");
    }

    fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}
