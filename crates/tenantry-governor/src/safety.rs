//! Safety governor: the autonomy circuit breaker.
//!
//! State lives in the store as a versioned singleton. Every write is a
//! compare-and-swap on `version`; losers reload and re-decide. Nothing in
//! here ever clears an auto-pause on its own: a trip ends when the window
//! elapses or an administrator clears it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tenantry_kernel::{CallerIdentity, GovernorState, KernelError, OpsRepository, SharedClock};

const MAX_CAS_ATTEMPTS: usize = 5;

/// Outcome of one `evaluate_and_auto_pause` pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernorEvaluation {
    pub blocked: bool,
    pub tripped: bool,
    pub failure_rate_pct: f64,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub critical_open: u64,
    pub reason: Option<String>,
    pub state: GovernorState,
}

/// Administrator patch. Absent fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorPatch {
    pub kill_switch: Option<bool>,
    pub reason: Option<String>,
    pub failure_threshold_pct: Option<u8>,
    pub critical_open_threshold: Option<u32>,
    pub window_hours: Option<u32>,
    pub clear_auto_pause: bool,
}

impl GovernorPatch {
    pub fn is_empty(&self) -> bool {
        self.kill_switch.is_none()
            && self.reason.is_none()
            && self.failure_threshold_pct.is_none()
            && self.critical_open_threshold.is_none()
            && self.window_hours.is_none()
            && !self.clear_auto_pause
    }

    fn apply(&self, state: &mut GovernorState) {
        if let Some(kill_switch) = self.kill_switch {
            state.kill_switch = kill_switch;
            state.reason = if kill_switch {
                self.reason.clone().or_else(|| state.reason.clone())
            } else {
                None
            };
        } else if let Some(reason) = &self.reason {
            state.reason = Some(reason.clone());
        }
        if let Some(pct) = self.failure_threshold_pct {
            state.failure_threshold_pct = pct;
        }
        if let Some(threshold) = self.critical_open_threshold {
            state.critical_open_threshold = threshold;
        }
        if let Some(hours) = self.window_hours {
            state.window_hours = hours;
        }
        if self.clear_auto_pause {
            state.auto_pause_until = None;
            state.auto_pause_reason = None;
        }
    }
}

pub struct SafetyGovernor {
    repo: Arc<dyn OpsRepository>,
    clock: SharedClock,
}

impl SafetyGovernor {
    pub fn new(repo: Arc<dyn OpsRepository>, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    pub async fn state(&self) -> Result<GovernorState, KernelError> {
        self.repo.load_governor().await
    }

    pub async fn is_blocked(&self) -> Result<bool, KernelError> {
        Ok(self.state().await?.is_blocked(self.clock.now()))
    }

    /// `Some(reason)` when autonomous triggering must not start.
    pub async fn block_reason(&self) -> Result<Option<String>, KernelError> {
        Ok(self.state().await?.block_reason(self.clock.now()))
    }

    /// Computes trailing-window failure rate and open critical exceptions and
    /// trips the auto-pause when either crosses its threshold.
    pub async fn evaluate_and_auto_pause(&self) -> Result<GovernorEvaluation, KernelError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.repo.load_governor().await?;
            let since = now - current.window();
            let stats = self.repo.run_stats_since(since).await?;
            let critical_open = self.repo.count_open_critical_since(since).await?;
            let failure_rate_pct = stats.failure_rate_pct();

            let mut evaluation = GovernorEvaluation {
                blocked: current.is_blocked(now),
                tripped: false,
                failure_rate_pct,
                total_runs: stats.total,
                failed_runs: stats.failed,
                critical_open,
                reason: current.block_reason(now),
                state: current.clone(),
            };

            // an active pause is left alone so its deadline does not creep
            if current.is_auto_paused(now) {
                return Ok(evaluation);
            }

            let trip_reason = if stats.total > 0
                && failure_rate_pct >= f64::from(current.failure_threshold_pct)
            {
                Some(format!(
                    "failure rate {:.1}% >= {}% over {}h ({} of {} runs)",
                    failure_rate_pct,
                    current.failure_threshold_pct,
                    current.window_hours,
                    stats.failed,
                    stats.total
                ))
            } else if critical_open >= u64::from(current.critical_open_threshold) {
                Some(format!(
                    "{} open critical exceptions >= {} over {}h",
                    critical_open, current.critical_open_threshold, current.window_hours
                ))
            } else {
                None
            };

            let Some(trip_reason) = trip_reason else {
                return Ok(evaluation);
            };

            let mut next = current.clone();
            next.auto_pause_until = Some(now + current.window());
            next.auto_pause_reason = Some(trip_reason.clone());
            next.version = current.version + 1;
            next.updated_at = Some(now);
            next.updated_by = Some("safety-governor".to_string());

            if self
                .repo
                .compare_and_swap_governor(current.version, &next)
                .await?
            {
                tracing::warn!(
                    reason = %trip_reason,
                    auto_pause_until = ?next.auto_pause_until,
                    "governor_auto_paused"
                );
                evaluation.blocked = true;
                evaluation.tripped = true;
                evaluation.reason = next.block_reason(now);
                evaluation.state = next;
                return Ok(evaluation);
            }
            tracing::debug!("governor_cas_lost; reloading");
        }
        Err(KernelError::Conflict(
            "governor state kept changing during evaluation".into(),
        ))
    }

    /// Administrator read-modify-write. Clearing an auto-pause is only
    /// possible through here.
    pub async fn patch(
        &self,
        caller: &CallerIdentity,
        patch: &GovernorPatch,
    ) -> Result<GovernorState, KernelError> {
        if !caller.is_admin() {
            return Err(KernelError::Forbidden(
                "only administrators may change the safety governor".into(),
            ));
        }
        if patch.is_empty() {
            return Err(KernelError::Validation("governor patch is empty".into()));
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.repo.load_governor().await?;
            let mut next = current.clone();
            patch.apply(&mut next);
            next.validate()?;
            next.version = current.version + 1;
            next.updated_at = Some(now);
            next.updated_by = Some(caller.id.clone());

            if self
                .repo
                .compare_and_swap_governor(current.version, &next)
                .await?
            {
                tracing::info!(
                    updated_by = %caller.id,
                    kill_switch = next.kill_switch,
                    auto_pause_cleared = patch.clear_auto_pause,
                    version = next.version,
                    "governor_patched"
                );
                return Ok(next);
            }
        }
        Err(KernelError::Conflict(
            "governor state changed concurrently; retry the patch".into(),
        ))
    }
}
