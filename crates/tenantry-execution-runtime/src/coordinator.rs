//! Shared key-value coordinator used for mutual exclusion, idempotency
//! markers and rate-limit counters. Never a system of record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use tenantry_kernel::{DeploymentMode, KernelError};

/// Subjects longer than this are replaced by their SHA-256 digest.
pub const MAX_SUBJECT_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The outcome is indeterminate: the write may or may not have landed.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

impl From<CoordinatorError> for KernelError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Unavailable(msg) => KernelError::CoordinatorUnavailable(msg),
        }
    }
}

/// Counter state returned by [Coordinator::incr_window].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

/// Atomic primitives over expiring keys. `now` is supplied by the caller so
/// every participant agrees on expiry.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Stores `value` under `key` iff the key is absent or expired.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError>;

    /// Deletes `key` iff it currently holds `expected`.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError>;

    /// Increments a fixed-window counter, starting a fresh window of `ttl`
    /// when the key is absent or expired.
    async fn incr_window(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, CoordinatorError>;

    /// Deletes every key expired at `now`; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    Lock,
    Replay,
    RateLimit,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Lock => "lock",
            Subsystem::Replay => "replay",
            Subsystem::RateLimit => "ratelimit",
        }
    }
}

/// Builds `{prefix}:{subsystem}:{subject}` keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, subsystem: Subsystem, subject: &str) -> String {
        let subject = if subject.len() > MAX_SUBJECT_BYTES {
            hex::encode(Sha256::digest(subject.as_bytes()))
        } else {
            subject.to_string()
        };
        format!("{}:{}:{}", self.prefix, subsystem.as_str(), subject)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("tenantry")
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Process-local coordinator. Correct only while a single process is
/// running; used in tests and as the development fallback.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `key` holds an unexpired value.
    pub fn is_live(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries()
            .get(key)
            .is_some_and(|e| e.expires_at > now)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                count: 0,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(existing) if existing.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_window(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, CoordinatorError> {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(WindowCount {
            count: entry.count,
            expires_at: entry.expires_at,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

/// Wraps the shared coordinator with a process-local one that takes over
/// when the shared one is unreachable, in development only. In production
/// the error is passed through so callers fail closed.
///
/// A key taken locally during an outage keeps blocking `set_if_absent` for
/// its TTL after the shared coordinator recovers. Window counters are not
/// merged: a window that straddles an outage counts each side separately.
pub struct FallbackCoordinator {
    primary: Arc<dyn Coordinator>,
    local: InMemoryCoordinator,
    mode: DeploymentMode,
}

impl FallbackCoordinator {
    pub fn new(primary: Arc<dyn Coordinator>, mode: DeploymentMode) -> Self {
        Self {
            primary,
            local: InMemoryCoordinator::new(),
            mode,
        }
    }

    fn fallback_allowed(&self, op: &str, err: &CoordinatorError) -> bool {
        if self.mode.allows_local_fallback() {
            tracing::warn!(op, error = %err, "coordinator_local_fallback");
            true
        } else {
            tracing::error!(op, error = %err, "coordinator_unavailable_fail_closed");
            false
        }
    }
}

#[async_trait]
impl Coordinator for FallbackCoordinator {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        if self.local.is_live(key, now) {
            return Ok(false);
        }
        match self.primary.set_if_absent(key, value, ttl, now).await {
            Err(err) if self.fallback_allowed("set_if_absent", &err) => {
                self.local.set_if_absent(key, value, ttl, now).await
            }
            other => other,
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        // the holder may have acquired through either side
        let local = self.local.compare_and_delete(key, expected, now).await?;
        match self.primary.compare_and_delete(key, expected, now).await {
            Ok(primary) => Ok(primary || local),
            Err(err) if self.fallback_allowed("compare_and_delete", &err) => Ok(local),
            Err(err) => Err(err),
        }
    }

    async fn incr_window(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, CoordinatorError> {
        match self.primary.incr_window(key, ttl, now).await {
            Err(err) if self.fallback_allowed("incr_window", &err) => {
                self.local.incr_window(key, ttl, now).await
            }
            other => other,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
        let local = self.local.purge_expired(now).await?;
        match self.primary.purge_expired(now).await {
            Ok(primary) => Ok(primary + local),
            Err(err) if self.fallback_allowed("purge_expired", &err) => Ok(local),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Coordinator whose every call reports an indeterminate outcome.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct UnreachableCoordinator;

    #[async_trait]
    impl Coordinator for UnreachableCoordinator {
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
            _now: DateTime<Utc>,
        ) -> Result<bool, CoordinatorError> {
            Err(CoordinatorError::Unavailable("connection refused".into()))
        }

        async fn compare_and_delete(
            &self,
            _key: &str,
            _expected: &str,
            _now: DateTime<Utc>,
        ) -> Result<bool, CoordinatorError> {
            Err(CoordinatorError::Unavailable("connection refused".into()))
        }

        async fn incr_window(
            &self,
            _key: &str,
            _ttl: Duration,
            _now: DateTime<Utc>,
        ) -> Result<WindowCount, CoordinatorError> {
            Err(CoordinatorError::Unavailable("connection refused".into()))
        }

        async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
            Err(CoordinatorError::Unavailable("connection refused".into()))
        }
    }

    /// In-memory coordinator that can be taken offline and brought back.
    #[derive(Clone, Default)]
    pub struct SwitchableCoordinator {
        pub store: InMemoryCoordinator,
        down: Arc<AtomicBool>,
    }

    impl SwitchableCoordinator {
        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), CoordinatorError> {
            if self.down.load(Ordering::SeqCst) {
                Err(CoordinatorError::Unavailable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Coordinator for SwitchableCoordinator {
        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
            now: DateTime<Utc>,
        ) -> Result<bool, CoordinatorError> {
            self.check()?;
            self.store.set_if_absent(key, value, ttl, now).await
        }

        async fn compare_and_delete(
            &self,
            key: &str,
            expected: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, CoordinatorError> {
            self.check()?;
            self.store.compare_and_delete(key, expected, now).await
        }

        async fn incr_window(
            &self,
            key: &str,
            ttl: Duration,
            now: DateTime<Utc>,
        ) -> Result<WindowCount, CoordinatorError> {
            self.check()?;
            self.store.incr_window(key, ttl, now).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
            self.check()?;
            self.store.purge_expired(now).await
        }
    }
}
