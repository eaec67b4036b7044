//! Finalization configuration.
//!
//! Loaded from a YAML file and/or assembled from CLI flags. Every field has a
//! serde default so a partial file can be completed by flags; `validate()`
//! rejects anything still missing before the store is touched.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FinalizeError, FinalizeResult};
use crate::lease::{LeaseSettings, DEFAULT_LEASE_DURATION, DEFAULT_MAX_WAIT, DEFAULT_RETRY_DELAY};
use crate::version::is_bare_version;

/// Inputs for one finalization run
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeConfig {
    /// Blob leased as the cross-pipeline mutex
    #[serde(default)]
    pub semaphore_blob: String,

    /// Prefix under which per-version marker blobs live
    #[serde(default)]
    pub finalize_container: String,

    /// Storage container holding every blob below
    #[serde(default)]
    pub container_name: String,

    /// Release channel (partition of Binaries/, Installers/, dnvm/)
    #[serde(default)]
    pub channel: String,

    /// Version being finalized
    #[serde(default)]
    pub version: String,

    /// Runtime identifiers that get a shared-framework stamp file
    #[serde(default)]
    pub publish_rids: Vec<String>,

    /// Commit written as the first line of each stamp file
    #[serde(default)]
    pub commit_hash: Option<String>,

    /// Promote even if the version is already marked finalized
    #[serde(default)]
    pub force_publish: bool,

    /// Lease acquisition timing
    #[serde(default)]
    pub lease: LeaseConfig,
}

/// Lease timing as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseConfig {
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

fn default_max_wait_secs() -> u64 {
    DEFAULT_MAX_WAIT.as_secs()
}

fn default_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_duration_secs() -> u64 {
    DEFAULT_LEASE_DURATION.as_secs()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait_secs(),
            delay_ms: default_delay_ms(),
            duration_secs: default_duration_secs(),
        }
    }
}

impl LeaseConfig {
    #[must_use]
    pub fn settings(&self) -> LeaseSettings {
        LeaseSettings {
            max_wait: Duration::from_secs(self.max_wait_secs),
            delay: Duration::from_millis(self.delay_ms),
            duration: Duration::from_secs(self.duration_secs),
        }
    }
}

impl FinalizeConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> FinalizeResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> FinalizeResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            FinalizeError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Check that every required value is present and usable.
    pub fn validate(&self) -> FinalizeResult<()> {
        let required = [
            ("semaphoreBlob", &self.semaphore_blob),
            ("finalizeContainer", &self.finalize_container),
            ("containerName", &self.container_name),
            ("channel", &self.channel),
            ("version", &self.version),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(FinalizeError::InvalidConfig(format!("{name} is required")));
            }
        }

        if !is_bare_version(&self.version) {
            return Err(FinalizeError::InvalidConfig(format!(
                "version '{}' is not of the form MAJOR.MINOR.PATCH[-[tag-]build-revision]",
                self.version
            )));
        }

        if self.publish_rids.is_empty() {
            return Err(FinalizeError::InvalidConfig(
                "publishRids must list at least one runtime identifier".to_string(),
            ));
        }
        if let Some(rid) = self
            .publish_rids
            .iter()
            .find(|rid| rid.trim().is_empty() || rid.contains('/'))
        {
            return Err(FinalizeError::InvalidConfig(format!(
                "invalid runtime identifier '{rid}'"
            )));
        }

        if self.lease.duration_secs == 0 {
            return Err(FinalizeError::InvalidConfig(
                "lease.durationSecs must be at least 1".to_string(),
            ));
        }
        if self.lease.delay_ms == 0 {
            return Err(FinalizeError::InvalidConfig(
                "lease.delayMs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
