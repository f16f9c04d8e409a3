//! voxgate server binary.
//!
//! Loads configuration, assembles the call engine, and serves the read-only
//! ops surface. Call traffic itself arrives through the deployment's
//! telephony integration, which drives sessions via [`voxgate::CallEngine`].

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use voxgate::config::EngineConfig;
use voxgate::session::CallEngine;
use voxgate::sink::MemorySink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxgate=info")),
        )
        .init();

    let config_path = std::env::var("VOXGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("voxgate.json"));
    let config = EngineConfig::load(&config_path)?;
    let registry = config.build_registry()?;

    // TODO: replace with the deployment's durable call log sink once the
    // warehouse endpoint is provisioned.
    let sink = Arc::new(MemorySink::new());

    let engine = CallEngine::new(&config, registry, sink);

    tokio::select! {
        result = voxgate::api::serve(Arc::clone(&engine), &config.bind_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, completing live calls");
            engine.shutdown().await;
            Ok(())
        }
    }
}
