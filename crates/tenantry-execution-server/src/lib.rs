//! HTTP surface of the Tenantry autopilot control plane.
//!
//! [`runtime_builder`] picks storage and coordination from a
//! [`ServerConfig`]; embedders register their workflow engines and action
//! executors on the returned builder and hand the runtime to [`serve`].

pub mod api_errors;
pub mod api_handlers;
pub mod api_models;
pub mod auth;
pub mod config;

use std::sync::Arc;

use tenantry_execution_runtime::{InMemoryCoordinator, OpsRuntime, OpsRuntimeBuilder};
use tenantry_kernel::InMemoryRepository;

pub use api_errors::ApiError;
pub use api_handlers::{build_router, ControlPlaneState};
pub use config::ServerConfig;

/// Postgres when a database URL is configured, in-memory otherwise.
pub fn runtime_builder(config: &ServerConfig) -> Result<OpsRuntimeBuilder, String> {
    let builder = match config.database_url.as_deref() {
        Some(url) => postgres_builder(url, &config.postgres_schema)?,
        None => {
            if config.deployment().is_production() {
                return Err("production requires TENANTRY_DATABASE_URL".to_string());
            }
            tracing::warn!("in_memory_storage_single_process_only");
            OpsRuntimeBuilder::new(
                Arc::new(InMemoryRepository::new()),
                Arc::new(InMemoryCoordinator::new()),
            )
        }
    };
    Ok(builder.config(config.runtime.clone()))
}

#[cfg(feature = "kernel-postgres")]
fn postgres_builder(url: &str, schema: &str) -> Result<OpsRuntimeBuilder, String> {
    use tenantry_execution_runtime::PostgresCoordinator;
    use tenantry_kernel::PostgresRepository;

    let repo = PostgresRepository::connect_lazy(url)
        .map_err(|e| format!("postgres repository init failed: {}", e))?
        .with_schema(schema);
    let coordinator = PostgresCoordinator::connect_lazy(url)
        .map_err(|e| format!("postgres coordinator init failed: {}", e))?
        .with_schema(schema);
    Ok(OpsRuntimeBuilder::new(
        Arc::new(repo),
        Arc::new(coordinator),
    ))
}

#[cfg(not(feature = "kernel-postgres"))]
fn postgres_builder(_url: &str, _schema: &str) -> Result<OpsRuntimeBuilder, String> {
    Err(
        "TENANTRY_DATABASE_URL requires feature 'kernel-postgres'. Rebuild with --features \"kernel-postgres\"."
            .to_string(),
    )
}

/// Binds and serves until the listener fails.
pub async fn serve(config: ServerConfig, runtime: OpsRuntime) -> Result<(), String> {
    let state = ControlPlaneState::new(Arc::new(runtime), &config);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| format!("bind {} failed: {}", config.bind_addr, e))?;
    tracing::info!(
        addr = %config.bind_addr,
        deployment = %config.deployment(),
        "server_listening"
    );
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_without_database_builds_in_memory() {
        let config = ServerConfig::default();
        let runtime = runtime_builder(&config).expect("in-memory builder").build();
        assert_eq!(runtime.config().coordinator_prefix, "tenantry");
    }

    #[test]
    fn production_without_database_is_refused() {
        let mut config = ServerConfig::default();
        config.runtime.deployment = tenantry_kernel::DeploymentMode::Production;
        let err = runtime_builder(&config).err().expect("must refuse");
        assert!(err.contains("TENANTRY_DATABASE_URL"));
    }
}
