//! Server configuration read from `TENANTRY_*` environment variables.

use std::collections::HashMap;
use std::time::Duration;

use tenantry_execution_runtime::{
    clamp_batch_size, RateLimitRule, RuntimeConfig, DEFAULT_BATCH_SIZE, DEFAULT_LOCK_TTL_SECS,
};
use tenantry_kernel::DeploymentMode;

const ENV_KEYS: &[&str] = &[
    "TENANTRY_ENV",
    "TENANTRY_BIND_ADDR",
    "TENANTRY_DATABASE_URL",
    "TENANTRY_POSTGRES_SCHEMA",
    "TENANTRY_COORDINATOR_PREFIX",
    "TENANTRY_CRON_SECRET",
    "TENANTRY_LOCK_TTL_SECS",
    "TENANTRY_WORKER_BATCH_SIZE",
    "TENANTRY_MANUAL_TRIGGER_LIMIT",
    "TENANTRY_MANUAL_TRIGGER_WINDOW_MS",
    "TENANTRY_LIST_LIMIT",
    "TENANTRY_LIST_WINDOW_MS",
    "TENANTRY_STREAM_MAX_SECS",
    "TENANTRY_STREAM_POLL_MS",
];

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_STREAM_MAX_SECS: u64 = 300;
pub const DEFAULT_STREAM_POLL_MS: u64 = 2_000;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub postgres_schema: String,
    /// Shared secret for the scheduler and worker tick endpoints.
    pub cron_secret: Option<String>,
    pub stream_max: Duration,
    pub stream_poll: Duration,
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            postgres_schema: "public".to_string(),
            cron_secret: None,
            stream_max: Duration::from_secs(DEFAULT_STREAM_MAX_SECS),
            stream_poll: Duration::from_millis(DEFAULT_STREAM_POLL_MS),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let deployment = match non_empty(envs, "TENANTRY_ENV") {
            Some(raw) => raw
                .parse::<DeploymentMode>()
                .map_err(|e| format!("invalid TENANTRY_ENV: {}", e))?,
            None => DeploymentMode::Development,
        };
        let defaults = RuntimeConfig::default();

        let database_url = non_empty(envs, "TENANTRY_DATABASE_URL");
        let cron_secret = non_empty(envs, "TENANTRY_CRON_SECRET");
        if deployment.is_production() {
            if database_url.is_none() {
                return Err("TENANTRY_ENV=production requires TENANTRY_DATABASE_URL".to_string());
            }
            if cron_secret.is_none() {
                return Err("TENANTRY_ENV=production requires TENANTRY_CRON_SECRET".to_string());
            }
        }

        let lock_ttl_secs = parse_num(envs, "TENANTRY_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS)?;
        if lock_ttl_secs <= 0 {
            return Err("TENANTRY_LOCK_TTL_SECS must be positive".to_string());
        }
        let worker_batch_size = clamp_batch_size(parse_num(
            envs,
            "TENANTRY_WORKER_BATCH_SIZE",
            DEFAULT_BATCH_SIZE,
        )?);
        let manual_trigger = RateLimitRule::new(
            parse_num(
                envs,
                "TENANTRY_MANUAL_TRIGGER_LIMIT",
                defaults.manual_trigger.limit,
            )?,
            parse_num(
                envs,
                "TENANTRY_MANUAL_TRIGGER_WINDOW_MS",
                defaults.manual_trigger.window_ms,
            )?,
        );
        let listing = RateLimitRule::new(
            parse_num(envs, "TENANTRY_LIST_LIMIT", defaults.listing.limit)?,
            parse_num(envs, "TENANTRY_LIST_WINDOW_MS", defaults.listing.window_ms)?,
        );
        for (name, rule) in [("manual trigger", manual_trigger), ("listing", listing)] {
            if rule.limit == 0 || rule.window_ms <= 0 {
                return Err(format!(
                    "{} rate limit and window must both be positive",
                    name
                ));
            }
        }

        let stream_max_secs = parse_num(envs, "TENANTRY_STREAM_MAX_SECS", DEFAULT_STREAM_MAX_SECS)?;
        let stream_poll_ms = parse_num(envs, "TENANTRY_STREAM_POLL_MS", DEFAULT_STREAM_POLL_MS)?;
        if stream_poll_ms == 0 {
            return Err("TENANTRY_STREAM_POLL_MS must be positive".to_string());
        }

        Ok(Self {
            bind_addr: non_empty(envs, "TENANTRY_BIND_ADDR")
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            database_url,
            postgres_schema: non_empty(envs, "TENANTRY_POSTGRES_SCHEMA")
                .unwrap_or_else(|| "public".to_string()),
            cron_secret,
            stream_max: Duration::from_secs(stream_max_secs),
            stream_poll: Duration::from_millis(stream_poll_ms),
            runtime: RuntimeConfig {
                deployment,
                coordinator_prefix: non_empty(envs, "TENANTRY_COORDINATOR_PREFIX")
                    .unwrap_or(defaults.coordinator_prefix),
                lock_ttl_secs,
                worker_batch_size,
                manual_trigger,
                listing,
                ..defaults
            },
        })
    }

    pub fn deployment(&self) -> DeploymentMode {
        self.runtime.deployment
    }
}

fn non_empty(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_num<T>(envs: &HashMap<String, String>, key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(envs, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| format!("invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}
