//! Replay/dedup cache: idempotency markers for event-to-run conversion.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use tenantry_kernel::SharedClock;

use crate::coordinator::{Coordinator, KeySpace, Subsystem};

const MARKER: &str = "1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeOutcome {
    /// First consumption inside the TTL window; the caller proceeds.
    Accepted,
    /// Already consumed inside the window; the caller skips.
    Duplicate,
    /// The coordinator could not answer. Callers proceed only outside
    /// production.
    Unavailable,
}

pub struct ReplayCache {
    coordinator: Arc<dyn Coordinator>,
    keys: KeySpace,
    clock: SharedClock,
}

impl ReplayCache {
    pub fn new(coordinator: Arc<dyn Coordinator>, keys: KeySpace, clock: SharedClock) -> Self {
        Self {
            coordinator,
            keys,
            clock,
        }
    }

    fn key(&self, namespace: &str, event_id: &str) -> String {
        self.keys
            .key(Subsystem::Replay, &format!("{}:{}", namespace, event_id))
    }

    pub async fn consume(&self, namespace: &str, event_id: &str, ttl: Duration) -> ConsumeOutcome {
        let key = self.key(namespace, event_id);
        let now = self.clock.now();
        match self.coordinator.set_if_absent(&key, MARKER, ttl, now).await {
            Ok(true) => ConsumeOutcome::Accepted,
            Ok(false) => {
                tracing::debug!(key = %key, "replay_duplicate");
                ConsumeOutcome::Duplicate
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "replay_unavailable");
                ConsumeOutcome::Unavailable
            }
        }
    }

    /// Drops a consumed marker whose guarded work never happened, so the
    /// next delivery is accepted. Returns whether a marker was removed.
    pub async fn release(&self, namespace: &str, event_id: &str) -> bool {
        let key = self.key(namespace, event_id);
        let now = self.clock.now();
        match self.coordinator.compare_and_delete(&key, MARKER, now).await {
            Ok(removed) => {
                tracing::debug!(key = %key, removed, "replay_released");
                removed
            }
            Err(err) => {
                // the TTL reclaims it
                tracing::warn!(key = %key, error = %err, "replay_release_failed");
                false
            }
        }
    }
}
