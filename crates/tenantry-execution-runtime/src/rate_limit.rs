//! Fixed-window rate limiter keyed by (bucket, key).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tenantry_kernel::{DeploymentMode, SharedClock};

use crate::coordinator::{Coordinator, KeySpace, Subsystem};

pub const MANUAL_TRIGGER_BUCKET: &str = "manual_trigger";
pub const LIST_BUCKET: &str = "list";

/// A limit and the window it applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window_ms: i64,
}

impl RateLimitRule {
    pub fn new(limit: u64, window_ms: i64) -> Self {
        Self { limit, window_ms }
    }

    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    coordinator: Arc<dyn Coordinator>,
    keys: KeySpace,
    clock: SharedClock,
    mode: DeploymentMode,
}

impl RateLimiter {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keys: KeySpace,
        clock: SharedClock,
        mode: DeploymentMode,
    ) -> Self {
        Self {
            coordinator,
            keys,
            clock,
            mode,
        }
    }

    pub async fn check_rule(
        &self,
        bucket: &str,
        key: &str,
        rule: RateLimitRule,
    ) -> RateLimitDecision {
        self.check(bucket, key, rule.limit, rule.window()).await
    }

    /// Counts this call against the window and reports whether it fits.
    pub async fn check(
        &self,
        bucket: &str,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> RateLimitDecision {
        let coordinator_key = self
            .keys
            .key(Subsystem::RateLimit, &format!("{}:{}", bucket, key));
        let now = self.clock.now();
        match self.coordinator.incr_window(&coordinator_key, window, now).await {
            Ok(counted) => {
                let allowed = counted.count <= limit;
                if !allowed {
                    tracing::info!(bucket, key, limit, "rate_limited");
                }
                RateLimitDecision {
                    allowed,
                    limit,
                    remaining: limit.saturating_sub(counted.count),
                    reset_at: counted.expires_at,
                }
            }
            Err(err) => {
                let allowed = !self.mode.is_production();
                tracing::warn!(bucket, key, allowed, error = %err, "rate_limit_unavailable");
                RateLimitDecision {
                    allowed,
                    limit,
                    remaining: 0,
                    reset_at: now + window,
                }
            }
        }
    }
}
