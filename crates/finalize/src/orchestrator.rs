//! # Finalize Orchestrator
//!
//! Entry point for one finalization run: makes sure the semaphore exists,
//! takes the lease, consults the version gate, and promotes the build.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, info_span, Instrument};

use crate::config::FinalizeConfig;
use crate::error::FinalizeResult;
use crate::gate::VersionGate;
use crate::lease::LeaseManager;
use crate::logger::BuildLogger;
use crate::promotion::{PromotionEngine, PromotionReport};
use crate::store::BlobStore;

/// Phase of a run, attached to log spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStage {
    EnsureSemaphore,
    AcquireLease,
    CheckGate,
    Promote,
    ReleaseLease,
}

impl fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EnsureSemaphore => "ensure-semaphore",
            Self::AcquireLease => "acquire-lease",
            Self::CheckGate => "check-gate",
            Self::Promote => "promote",
            Self::ReleaseLease => "release-lease",
        })
    }
}

/// What a completed run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The version was already finalized and nothing was copied
    Skipped { version: String },
    /// Promotion ran; the report says whether every step succeeded
    Promoted(PromotionReport),
}

impl FinalizeOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Skipped { .. } => true,
            Self::Promoted(report) => report.succeeded(),
        }
    }
}

/// Runs the finalization protocol against one store.
pub struct Finalizer {
    store: Arc<dyn BlobStore>,
    config: FinalizeConfig,
    logger: Arc<dyn BuildLogger>,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        config: FinalizeConfig,
        logger: Arc<dyn BuildLogger>,
    ) -> Self {
        Self {
            store,
            config,
            logger,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    /// Run the protocol and report what happened.
    ///
    /// The lease is always released before this returns, including when
    /// promotion fails. If a renewal fails mid-promotion, promotion stops and
    /// the result is [`crate::FinalizeError::LeaseLost`].
    pub async fn run(&self) -> FinalizeResult<FinalizeOutcome> {
        let version = self.config.version.clone();

        self.config
            .validate()
            .inspect_err(|e| error!(error = %e, "Invalid configuration"))?;

        let gate = VersionGate::new(
            Arc::clone(&self.store),
            self.config.semaphore_blob.clone(),
            self.config.finalize_container.clone(),
        );
        gate.ensure_semaphore_exists()
            .instrument(info_span!("stage", name = %FinalizeStage::EnsureSemaphore))
            .await?;

        let lease = LeaseManager::new(Arc::clone(&self.store), self.config.semaphore_blob.clone())
            .with_settings(self.config.lease.settings());

        info!(
            stage = %FinalizeStage::AcquireLease,
            semaphore = %lease.path(),
            version = %version,
            "Waiting for semaphore lease"
        );

        let outcome = lease
            .with_lease(|| self.check_and_promote(&gate, &version))
            .await;

        info!(stage = %FinalizeStage::ReleaseLease, semaphore = %lease.path(), "Lease scope closed");
        outcome
    }

    async fn check_and_promote(
        &self,
        gate: &VersionGate,
        version: &str,
    ) -> FinalizeResult<FinalizeOutcome> {
        let finalized = gate
            .is_finalized(version)
            .instrument(info_span!("stage", name = %FinalizeStage::CheckGate))
            .await?;

        if finalized && !self.config.force_publish {
            self.logger
                .info(&format!("Version {version} is already finalized, skipping"));
            return Ok(FinalizeOutcome::Skipped {
                version: version.to_string(),
            });
        }
        if finalized {
            self.logger.info(&format!(
                "Version {version} is already finalized, publishing again (forced)"
            ));
        }

        let engine = PromotionEngine::new(
            Arc::clone(&self.store),
            gate.clone(),
            Arc::clone(&self.logger),
            &self.config,
        );
        let report = engine
            .promote()
            .instrument(info_span!("stage", name = %FinalizeStage::Promote))
            .await?;
        Ok(FinalizeOutcome::Promoted(report))
    }

    /// Run the protocol and collapse the result to the host's verdict.
    ///
    /// `false` when the run returned an error, a copy or stamp failed, or
    /// anything was reported through the logger's error channel.
    pub async fn execute(&self) -> bool {
        match self.run().await {
            Ok(outcome) => {
                match &outcome {
                    FinalizeOutcome::Skipped { version } => {
                        info!(version = %version, "Finalization skipped");
                    }
                    FinalizeOutcome::Promoted(report) => {
                        info!(
                            version = %self.config.version,
                            purged = report.purge.deleted.len(),
                            stamps = report.stamps.len(),
                            "Finalization complete"
                        );
                    }
                }
                outcome.succeeded() && !self.logger.has_logged_errors()
            }
            Err(e) => {
                self.logger.error(&format!("Finalization failed: {e}"));
                false
            }
        }
    }
}
