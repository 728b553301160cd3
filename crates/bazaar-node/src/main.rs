//! Bazaar node binary.
//!
//! Loads configuration, registers the configured persistence engine,
//! bootstraps the storefront schema once the database is ready and keeps
//! the connection alive until Ctrl-C.

mod bootstrap;
mod config;
mod error;

use std::path::Path;
use std::sync::Arc;

use bazaar_db::{EngineRegistry, ReadyBroadcast};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::BazaarConfig;
use crate::error::NodeError;

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    let config = load_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        engine = ?config.database.engine,
        id_kind = %config.database.id_kind,
        "Bazaar node starting"
    );

    let registry = EngineRegistry::new();
    registry.register(config.database.build_engine())?;
    let engine = registry.engine()?.clone();

    let ready = Arc::new(ReadyBroadcast::new());
    bootstrap::register(&ready, engine.clone());

    let supervisor = engine.supervise(ready);
    if config.database.connect_async {
        supervisor.connect_async();
        info!("Connecting in the background");
    } else {
        supervisor.connect().await?;
        info!(state = ?supervisor.state(), "Database ready");
    }

    tokio::signal::ctrl_c().await?;
    info!(state = ?supervisor.state(), "Shutdown signal received");
    Ok(())
}

/// Load configuration from `BAZAAR_CONFIG` (default `bazaar.yaml`), falling
/// back to defaults plus environment overrides when the file is absent.
fn load_config() -> Result<BazaarConfig, NodeError> {
    let path = std::env::var("BAZAAR_CONFIG").unwrap_or_else(|_| "bazaar.yaml".to_owned());
    let path = Path::new(&path);
    if path.exists() {
        return Ok(BazaarConfig::from_file(path)?);
    }
    let mut config = BazaarConfig::default();
    config.database.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}
