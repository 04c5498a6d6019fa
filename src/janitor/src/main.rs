//! Edgefleet Janitor
//!
//! One-shot reclamation run over the fleet database and artifact store:
//! retention, image reclamation, device reclamation, orphan-commit sweep.
//! Exits zero on success (including flag-skipped stages) and non-zero on
//! the first failing stage; meant to be driven by a scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::config::Configuration;
use common::storage::object_store_from_dsn;
use common::{ConfigFlags, Database, FeatureGate};
use janitor::CleanupPipeline;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgefleet.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        Configuration::load_from_path(Path::new(&args.config))
            .context("Failed to load configuration")?
    } else {
        tracing::info!("Configuration file not found, using defaults");
        Configuration::default()
    };
    config.validate().context("Invalid configuration")?;

    let db = Database::connect(&config.database.dsn)
        .await
        .context("Failed to connect to the fleet database")?;
    db.ensure_schema()
        .await
        .context("Failed to ensure the fleet schema")?;

    let store = object_store_from_dsn(&config.storage.dsn)
        .context("Failed to create the artifact store")?;

    let flags: Arc<dyn FeatureGate> = Arc::new(ConfigFlags::new(&config.features));

    let pipeline = CleanupPipeline::new(db, store, flags, config.cleanup.clone());
    let summary = pipeline.run().await.context("Cleanup run failed")?;

    tracing::info!(?summary, "cleanup run complete");
    Ok(())
}
