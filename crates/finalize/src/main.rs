//! CLI for build finalization
//!
//! Run `finalize-build --help` for usage information.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use finalize::{FinalizeConfig, Finalizer, FsBlobStore, TracingLogger};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "finalize-build")]
#[command(about = "Publish a finished build as the latest release of its channel")]
#[command(version)]
struct Cli {
    /// YAML configuration file; flags override its values
    #[arg(short, long, env = "FINALIZE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the blob containers
    #[arg(long, env = "FINALIZE_STORE_ROOT")]
    store_root: PathBuf,

    /// Blob leased as the cross-pipeline mutex
    #[arg(long, env = "FINALIZE_SEMAPHORE_BLOB")]
    semaphore_blob: Option<String>,

    /// Prefix holding per-version marker blobs
    #[arg(long, env = "FINALIZE_CONTAINER")]
    finalize_container: Option<String>,

    /// Storage container name
    #[arg(long, env = "FINALIZE_CONTAINER_NAME")]
    container_name: Option<String>,

    /// Release channel
    #[arg(long, env = "FINALIZE_CHANNEL")]
    channel: Option<String>,

    /// Version to finalize
    #[arg(long, env = "FINALIZE_VERSION")]
    version: Option<String>,

    /// Runtime identifiers to stamp, comma separated
    #[arg(long, env = "FINALIZE_PUBLISH_RIDS", value_delimiter = ',')]
    publish_rids: Option<Vec<String>>,

    /// Commit hash written into stamp files
    #[arg(long, env = "FINALIZE_COMMIT_HASH")]
    commit_hash: Option<String>,

    /// Publish even if the version is already finalized
    #[arg(long, env = "FINALIZE_FORCE")]
    force: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    async fn load_config(&self) -> Result<FinalizeConfig> {
        let mut config = match &self.config {
            Some(path) => FinalizeConfig::from_file(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => FinalizeConfig::default(),
        };

        let overrides = [
            (&self.semaphore_blob, &mut config.semaphore_blob),
            (&self.finalize_container, &mut config.finalize_container),
            (&self.container_name, &mut config.container_name),
            (&self.channel, &mut config.channel),
            (&self.version, &mut config.version),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                field.clone_from(value);
            }
        }
        if let Some(rids) = &self.publish_rids {
            config.publish_rids.clone_from(rids);
        }
        if self.commit_hash.is_some() {
            config.commit_hash.clone_from(&self.commit_hash);
        }
        config.force_publish |= self.force;

        Ok(config)
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let config = cli.load_config().await?;
    info!(
        channel = %config.channel,
        version = %config.version,
        store_root = %cli.store_root.display(),
        "Starting finalization"
    );

    let store = Arc::new(FsBlobStore::new(&cli.store_root, config.container_name.clone()));
    let finalizer = Finalizer::new(store, config, Arc::new(TracingLogger::new()));

    if !finalizer.execute().await {
        std::process::exit(1);
    }
    Ok(())
}
