//! Deployment mode: decides whether coordination failures fail closed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Production,
    #[default]
    Development,
}

impl DeploymentMode {
    pub fn is_production(self) -> bool {
        matches!(self, DeploymentMode::Production)
    }

    /// Process-local coordination fallbacks are a single-process convenience
    /// and are never enabled in production.
    pub fn allows_local_fallback(self) -> bool {
        !self.is_production()
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(DeploymentMode::Production),
            "development" | "dev" | "test" | "local" => Ok(DeploymentMode::Development),
            other => Err(format!(
                "invalid deployment mode '{}'. expected one of: production, development",
                other
            )),
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Production => f.write_str("production"),
            DeploymentMode::Development => f.write_str("development"),
        }
    }
}
