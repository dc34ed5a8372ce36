//! Run lifecycle primitives.
//!
//! ```text
//! PENDING --start--> RUNNING --complete--> COMPLETED
//!                    RUNNING --fail, attempts < max--> PENDING
//!                    RUNNING --fail, attempts = max--> ESCALATED (dlq)
//! PENDING|RUNNING --cancel--> FAILED ("cancelled")
//! ESCALATED --replay--> PENDING
//! ```
//!
//! Every transition is a compare-and-swap on the observed (status,
//! attempts). A lost swap means another invocation moved the run first and
//! is reported as `None` rather than an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tenantry_kernel::{
    KernelError, OpsRepository, Run, RunQuery, RunStatus, SharedClock, CANCELLED_ERROR, DLQ_FLAG,
};

/// How a replay treats the attempt counter of a dead-lettered run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Attempts go back to zero; the run gets a full retry budget.
    #[default]
    ResetAttempts,
    /// Attempts are kept and `max_attempts` becomes `attempts + 1`, so the
    /// replay is exactly one more try.
    PreserveAttempts,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FailureOutcome {
    Requeued(Run),
    Escalated(Run),
}

impl FailureOutcome {
    pub fn run(&self) -> &Run {
        match self {
            FailureOutcome::Requeued(run) | FailureOutcome::Escalated(run) => run,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleReport {
    pub requeued: usize,
    pub escalated: usize,
}

pub struct RunLifecycle {
    repo: Arc<dyn OpsRepository>,
    clock: SharedClock,
}

impl RunLifecycle {
    pub fn new(repo: Arc<dyn OpsRepository>, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    async fn swap(&self, observed: &Run, next: &Run) -> Result<bool, KernelError> {
        self.repo
            .compare_and_swap_run(observed.status, observed.attempts, next)
            .await
    }

    /// PENDING → RUNNING, consuming one attempt. A pending run that has
    /// somehow exhausted its attempts is escalated instead of started.
    pub async fn start(&self, observed: &Run) -> Result<Option<Run>, KernelError> {
        if observed.status != RunStatus::Pending {
            return Ok(None);
        }
        let now = self.clock.now();
        if !observed.has_attempts_left() {
            let mut next = observed.clone();
            escalate_in_place(&mut next, "attempts exhausted before start", now);
            if self.swap(observed, &next).await? {
                tracing::warn!(run_id = %next.id, attempts = next.attempts, "run_escalated");
            }
            return Ok(None);
        }
        let mut next = observed.clone();
        next.status = RunStatus::Running;
        next.attempts += 1;
        next.started_at = Some(now);
        next.updated_at = now;
        if !self.swap(observed, &next).await? {
            return Ok(None);
        }
        tracing::info!(
            run_id = %next.id,
            workflow_type = %next.workflow_type,
            attempt = next.attempts,
            max_attempts = next.max_attempts,
            "run_started"
        );
        Ok(Some(next))
    }

    /// RUNNING → COMPLETED with the engine summary merged in.
    pub async fn complete(
        &self,
        observed: &Run,
        summary: Value,
    ) -> Result<Option<Run>, KernelError> {
        if observed.status != RunStatus::Running {
            return Ok(None);
        }
        let now = self.clock.now();
        let mut next = observed.clone();
        next.status = RunStatus::Completed;
        next.merge_summary(summary);
        next.error = None;
        next.completed_at = Some(now);
        next.updated_at = now;
        if !self.swap(observed, &next).await? {
            return Ok(None);
        }
        tracing::info!(run_id = %next.id, attempts = next.attempts, "run_completed");
        Ok(Some(next))
    }

    /// RUNNING → PENDING while attempts remain, else → ESCALATED with the
    /// dead-letter flag set.
    pub async fn fail(
        &self,
        observed: &Run,
        error: &str,
    ) -> Result<Option<FailureOutcome>, KernelError> {
        if observed.status != RunStatus::Running {
            return Ok(None);
        }
        let now = self.clock.now();
        let mut next = observed.clone();
        if observed.has_attempts_left() {
            next.status = RunStatus::Pending;
            next.error = Some(error.to_string());
            next.started_at = None;
            next.updated_at = now;
            if !self.swap(observed, &next).await? {
                return Ok(None);
            }
            tracing::warn!(
                run_id = %next.id,
                attempt = next.attempts,
                max_attempts = next.max_attempts,
                error,
                "run_requeued"
            );
            return Ok(Some(FailureOutcome::Requeued(next)));
        }
        escalate_in_place(&mut next, error, now);
        if !self.swap(observed, &next).await? {
            return Ok(None);
        }
        tracing::warn!(
            run_id = %next.id,
            attempts = next.attempts,
            error,
            "run_escalated"
        );
        Ok(Some(FailureOutcome::Escalated(next)))
    }

    /// Any non-terminal status → FAILED. Observed by the worker before and
    /// after each side-effecting step; in-flight external calls finish.
    pub async fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<Run, KernelError> {
        let observed = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| KernelError::not_found("run", run_id))?;
        if observed.status.is_terminal() {
            return Err(KernelError::Conflict(format!(
                "run '{}' is already {}",
                run_id,
                observed.status.as_str()
            )));
        }
        let now = self.clock.now();
        let mut next = observed.clone();
        next.status = RunStatus::Failed;
        next.error = Some(match reason {
            Some(reason) if !reason.trim().is_empty() => {
                format!("{}: {}", CANCELLED_ERROR, reason.trim())
            }
            _ => CANCELLED_ERROR.to_string(),
        });
        next.completed_at = Some(now);
        next.updated_at = now;
        if !self.swap(&observed, &next).await? {
            return Err(KernelError::Conflict(format!(
                "run '{}' changed while cancelling",
                run_id
            )));
        }
        tracing::info!(run_id = %next.id, "run_cancelled");
        Ok(next)
    }

    /// ESCALATED → PENDING with the dead-letter flag cleared.
    pub async fn replay(&self, run_id: &str, mode: ReplayMode) -> Result<Run, KernelError> {
        let observed = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| KernelError::not_found("run", run_id))?;
        if observed.status != RunStatus::Escalated {
            return Err(KernelError::Conflict(format!(
                "only ESCALATED runs can be replayed; run '{}' is {}",
                run_id,
                observed.status.as_str()
            )));
        }
        let now = self.clock.now();
        let mut next = observed.clone();
        next.status = RunStatus::Pending;
        match mode {
            ReplayMode::ResetAttempts => next.attempts = 0,
            ReplayMode::PreserveAttempts => next.max_attempts = next.attempts + 1,
        }
        let replays = observed
            .summary
            .get("replay_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if let Value::Object(summary) = &mut next.summary {
            summary.remove(DLQ_FLAG);
        }
        next.set_summary_field("replay_count", json!(replays + 1));
        if let Some(error) = next.error.take() {
            next.set_summary_field("last_error", json!(error));
        }
        next.started_at = None;
        next.completed_at = None;
        next.updated_at = now;
        if !self.swap(&observed, &next).await? {
            return Err(KernelError::Conflict(format!(
                "run '{}' changed while replaying",
                run_id
            )));
        }
        tracing::info!(
            run_id = %next.id,
            mode = ?mode,
            attempts = next.attempts,
            max_attempts = next.max_attempts,
            "run_replayed"
        );
        Ok(next)
    }

    /// RUNNING runs started before `started_before` belong to a crashed
    /// holder (their lock TTL has lapsed) and go through `fail`.
    pub async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<StaleReport, KernelError> {
        let stale = self
            .repo
            .list_runs(&RunQuery {
                statuses: vec![RunStatus::Running],
                started_before: Some(started_before),
                limit,
                ..RunQuery::default()
            })
            .await?;
        let mut report = StaleReport::default();
        for run in stale {
            match self.fail(&run, "worker lost its lock before finishing").await? {
                Some(FailureOutcome::Requeued(_)) => report.requeued += 1,
                Some(FailureOutcome::Escalated(_)) => report.escalated += 1,
                None => {}
            }
        }
        Ok(report)
    }
}

fn escalate_in_place(run: &mut Run, error: &str, now: DateTime<Utc>) {
    run.status = RunStatus::Escalated;
    run.error = Some(error.to_string());
    run.set_summary_field(DLQ_FLAG, json!(true));
    run.completed_at = Some(now);
    run.updated_at = now;
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use tenantry_kernel::{Clock, InMemoryRepository, ManualClock, TriggerType};

    use super::*;

    fn setup() -> (Arc<InMemoryRepository>, Arc<ManualClock>, RunLifecycle) {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let lifecycle = RunLifecycle::new(repo.clone(), clock.clone());
        (repo, clock, lifecycle)
    }

    async fn pending(repo: &InMemoryRepository, clock: &ManualClock) -> Run {
        let run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, clock.now());
        repo.insert_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn third_failure_escalates_with_dlq() {
        let (repo, clock, lifecycle) = setup();
        let mut run = pending(&repo, &clock).await;
        for attempt in 1..=3u32 {
            let started = lifecycle.start(&run).await.unwrap().unwrap();
            assert_eq!(started.attempts, attempt);
            assert!(started.attempts <= started.max_attempts);
            let outcome = lifecycle.fail(&started, "boom").await.unwrap().unwrap();
            run = outcome.run().clone();
            if attempt < 3 {
                assert!(matches!(outcome, FailureOutcome::Requeued(_)));
            } else {
                assert!(matches!(outcome, FailureOutcome::Escalated(_)));
            }
        }
        assert_eq!(run.status, RunStatus::Escalated);
        assert!(run.is_dead_lettered());
        assert_eq!(run.attempts, run.max_attempts);
    }

    #[tokio::test]
    async fn second_starter_loses_the_swap() {
        let (repo, clock, lifecycle) = setup();
        let run = pending(&repo, &clock).await;
        assert!(lifecycle.start(&run).await.unwrap().is_some());
        assert!(lifecycle.start(&run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_wins_over_late_completion() {
        let (repo, clock, lifecycle) = setup();
        let run = pending(&repo, &clock).await;
        let started = lifecycle.start(&run).await.unwrap().unwrap();
        let cancelled = lifecycle.cancel(&run.id, Some("tenant moved out")).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled: tenant moved out"));
        assert!(lifecycle.complete(&started, json!({})).await.unwrap().is_none());
        assert!(matches!(
            lifecycle.cancel(&run.id, None).await,
            Err(KernelError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn replay_modes() {
        let (repo, clock, lifecycle) = setup();
        let mut run = pending(&repo, &clock).await;
        for _ in 0..3 {
            let started = lifecycle.start(&run).await.unwrap().unwrap();
            run = lifecycle.fail(&started, "boom").await.unwrap().unwrap().run().clone();
        }

        let replayed = lifecycle
            .replay(&run.id, ReplayMode::PreserveAttempts)
            .await
            .unwrap();
        assert_eq!(replayed.status, RunStatus::Pending);
        assert!(!replayed.is_dead_lettered());
        assert_eq!((replayed.attempts, replayed.max_attempts), (3, 4));
        assert_eq!(replayed.summary["last_error"], json!("boom"));

        // exactly one more try before escalating again
        let started = lifecycle.start(&replayed).await.unwrap().unwrap();
        let again = lifecycle.fail(&started, "boom").await.unwrap().unwrap();
        assert!(matches!(again, FailureOutcome::Escalated(_)));

        let reset = lifecycle
            .replay(&run.id, ReplayMode::ResetAttempts)
            .await
            .unwrap();
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.summary["replay_count"], json!(2));

        assert!(matches!(
            lifecycle.replay(&run.id, ReplayMode::ResetAttempts).await,
            Err(KernelError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stale_running_runs_are_requeued() {
        let (repo, clock, lifecycle) = setup();
        let run = pending(&repo, &clock).await;
        lifecycle.start(&run).await.unwrap().unwrap();
        clock.advance(Duration::minutes(20));
        let report = lifecycle
            .requeue_stale(clock.now() - Duration::minutes(15), 50)
            .await
            .unwrap();
        assert_eq!(report, StaleReport { requeued: 1, escalated: 0 });
        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Pending);
        assert_eq!(stored.attempts, 1);
    }
}
