#![warn(clippy::pedantic)]
// Allow common pedantic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

//! # Finalize
//!
//! Publishes a finished build as the "latest" release of its channel.
//!
//! Many pipelines may finish at once and all try to publish. This crate
//! serializes them with an exclusive lease on a semaphore blob and makes the
//! publish idempotent with a per-version marker blob:
//!
//! - [`store`]: blob store facade plus in-memory and filesystem backends
//! - [`lease`]: retrying acquisition and background renewal of the lease
//! - [`gate`]: marker blobs recording which versions are finalized
//! - [`promotion`]: copies artifacts to `Latest/` and writes version stamps
//! - [`orchestrator`]: ties the steps together for one run
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use finalize::{FinalizeConfig, Finalizer, FsBlobStore, TracingLogger};
//!
//! let config = FinalizeConfig::from_file("finalize.yaml").await?;
//! let store = Arc::new(FsBlobStore::new("/srv/blobs", config.container_name.clone()));
//! let ok = Finalizer::new(store, config, Arc::new(TracingLogger::new()))
//!     .execute()
//!     .await;
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod lease;
pub mod logger;
pub mod orchestrator;
pub mod promotion;
pub mod store;
pub mod version;

pub use config::{FinalizeConfig, LeaseConfig};
pub use error::{FinalizeError, FinalizeResult, StoreError};
pub use gate::VersionGate;
pub use lease::{ActiveLease, LeaseManager, LeaseSettings};
pub use logger::{BuildLogger, TracingLogger};
pub use orchestrator::{FinalizeOutcome, FinalizeStage, Finalizer};
pub use promotion::{
    stamp_content, BatchOutcome, CopyResult, PromotionEngine, PromotionReport, PurgeOutcome,
};
pub use store::{BlobStore, FsBlobStore, Lease, MemoryBlobStore};
