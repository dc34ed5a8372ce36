//! `tenantry-server`: the control plane HTTP server.
//!
//! Run with:
//!   TENANTRY_ENV=development cargo run -p tenantry-execution-server
//!
//! Workflow engines and action executors are registered by embedding
//! applications through `tenantry_execution_server::runtime_builder`; this
//! binary serves the administrative surface with empty registries.

use tracing_subscriber::EnvFilter;

use tenantry_execution_server::{runtime_builder, serve, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env()?;
    let runtime = runtime_builder(&config)?.build();
    tracing::warn!("no_workflow_engines_registered");
    serve(config, runtime).await?;
    Ok(())
}
