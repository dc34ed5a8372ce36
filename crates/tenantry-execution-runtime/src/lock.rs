//! Lock manager: distributed mutual exclusion keyed by subject.
//!
//! A [LockHandle] is only ever produced by a successful set-if-absent, and
//! release is compare-token-then-delete, so a holder whose TTL lapsed cannot
//! delete a lock a newer holder acquired.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use tenantry_kernel::SharedClock;

use crate::coordinator::{Coordinator, KeySpace, Subsystem};

pub const DEFAULT_LOCK_TTL_SECS: i64 = 15 * 60;

/// Proof of lock ownership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct LockManager {
    coordinator: Arc<dyn Coordinator>,
    keys: KeySpace,
    clock: SharedClock,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(coordinator: Arc<dyn Coordinator>, keys: KeySpace, clock: SharedClock) -> Self {
        Self {
            coordinator,
            keys,
            clock,
            default_ttl: Duration::seconds(DEFAULT_LOCK_TTL_SECS),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn manager_subject(manager_id: &str) -> String {
        format!("manager:{}", manager_id)
    }

    pub fn action_subject(action_id: &str) -> String {
        format!("action:{}", action_id)
    }

    pub async fn acquire(&self, subject: &str) -> Option<LockHandle> {
        self.acquire_with_ttl(subject, self.default_ttl).await
    }

    /// `None` when another holder owns the key or the coordinator could not
    /// give a definite answer.
    pub async fn acquire_with_ttl(&self, subject: &str, ttl: Duration) -> Option<LockHandle> {
        let key = self.keys.key(Subsystem::Lock, subject);
        let token = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        match self.coordinator.set_if_absent(&key, &token, ttl, now).await {
            Ok(true) => {
                tracing::debug!(key = %key, "lock_acquired");
                Some(LockHandle {
                    key,
                    token,
                    expires_at: now + ttl,
                })
            }
            Ok(false) => {
                tracing::debug!(key = %key, "lock_held_elsewhere");
                None
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "lock_indeterminate_treated_as_held");
                None
            }
        }
    }

    /// Releases the lock iff the handle's token still owns it. Returns
    /// whether anything was deleted; a stale handle is a no-op.
    pub async fn release(&self, handle: LockHandle) -> bool {
        let now = self.clock.now();
        match self
            .coordinator
            .compare_and_delete(&handle.key, &handle.token, now)
            .await
        {
            Ok(true) => {
                tracing::debug!(key = %handle.key, "lock_released");
                true
            }
            Ok(false) => {
                tracing::info!(key = %handle.key, "lock_release_skipped_token_mismatch");
                false
            }
            Err(err) => {
                // the TTL reclaims it
                tracing::warn!(key = %handle.key, error = %err, "lock_release_failed");
                false
            }
        }
    }
}
