//! Batch worker advancing PENDING runs through the lifecycle.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tenantry_governor::SafetyGovernor;
use tenantry_kernel::{KernelError, OpsRepository, Run, RunQuery, RunStatus, SharedClock};

use crate::actions::ActionService;
use crate::coordinator::Coordinator;
use crate::engine::{EngineOutcome, EngineRegistry, RecordOrigin, RunContext};
use crate::exceptions::ExceptionService;
use crate::lifecycle::{FailureOutcome, RunLifecycle};
use crate::lock::LockManager;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const MAX_BATCH_SIZE: usize = 100;

pub fn clamp_batch_size(requested: usize) -> usize {
    requested.clamp(1, MAX_BATCH_SIZE)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTickReport {
    pub governor_blocked: bool,
    pub blocked_reason: Option<String>,
    pub picked: usize,
    pub completed: usize,
    pub requeued: usize,
    pub escalated: usize,
    pub skipped_locked: usize,
    pub cancelled: usize,
    pub stale_requeued: usize,
    pub stale_escalated: usize,
    pub expired_keys_purged: u64,
}

/// How one picked run ended this tick.
enum RunStep {
    Completed,
    Requeued,
    Escalated,
    SkippedLocked,
    /// Cancelled or moved by someone else mid-flight.
    Abandoned,
}

pub struct Worker {
    repo: Arc<dyn OpsRepository>,
    lifecycle: Arc<RunLifecycle>,
    locks: Arc<LockManager>,
    coordinator: Arc<dyn Coordinator>,
    governor: Arc<SafetyGovernor>,
    engines: EngineRegistry,
    actions: Arc<ActionService>,
    exceptions: Arc<ExceptionService>,
    clock: SharedClock,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn OpsRepository>,
        lifecycle: Arc<RunLifecycle>,
        locks: Arc<LockManager>,
        coordinator: Arc<dyn Coordinator>,
        governor: Arc<SafetyGovernor>,
        engines: EngineRegistry,
        actions: Arc<ActionService>,
        exceptions: Arc<ExceptionService>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            lifecycle,
            locks,
            coordinator,
            governor,
            engines,
            actions,
            exceptions,
            clock,
        }
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// One tick: purge expired coordinator keys, recover stale runs,
    /// re-evaluate the governor, then process up to `batch_size` of the
    /// oldest PENDING runs.
    pub async fn run_batch(&self, batch_size: usize) -> Result<WorkerTickReport, KernelError> {
        let batch_size = clamp_batch_size(batch_size);
        let mut report = WorkerTickReport::default();

        match self.coordinator.purge_expired(self.clock.now()).await {
            Ok(purged) => report.expired_keys_purged = purged,
            // housekeeping only; the next tick tries again
            Err(err) => tracing::warn!(error = %err, "coordinator_purge_failed"),
        }

        let lock_ttl: Duration = self.locks.default_ttl();
        let stale = self
            .lifecycle
            .requeue_stale(self.clock.now() - lock_ttl, batch_size)
            .await?;
        report.stale_requeued = stale.requeued;
        report.stale_escalated = stale.escalated;

        let evaluation = self.governor.evaluate_and_auto_pause().await?;
        if evaluation.blocked {
            report.governor_blocked = true;
            report.blocked_reason = evaluation.reason;
            tracing::info!(
                reason = report.blocked_reason.as_deref().unwrap_or(""),
                "worker_tick_blocked"
            );
            return Ok(report);
        }

        let pending = self.repo.list_runs(&RunQuery::pending(batch_size)).await?;
        report.picked = pending.len();
        for run in pending {
            let run_id = run.id.clone();
            match self.process(run).await {
                Ok(RunStep::Completed) => report.completed += 1,
                Ok(RunStep::Requeued) => report.requeued += 1,
                Ok(RunStep::Escalated) => report.escalated += 1,
                Ok(RunStep::SkippedLocked) => report.skipped_locked += 1,
                Ok(RunStep::Abandoned) => report.cancelled += 1,
                // Left RUNNING; the stale sweep picks it up after the lock TTL.
                Err(err) => tracing::error!(run_id = %run_id, error = %err, "worker_run_error"),
            }
        }
        tracing::info!(
            picked = report.picked,
            completed = report.completed,
            requeued = report.requeued,
            escalated = report.escalated,
            skipped_locked = report.skipped_locked,
            cancelled = report.cancelled,
            stale_requeued = report.stale_requeued,
            expired_keys_purged = report.expired_keys_purged,
            "worker_tick"
        );
        Ok(report)
    }

    async fn process(&self, run: Run) -> Result<RunStep, KernelError> {
        let Some(handle) = self
            .locks
            .acquire(&LockManager::manager_subject(&run.manager_id))
            .await
        else {
            tracing::debug!(run_id = %run.id, manager_id = %run.manager_id, "run_skipped_locked");
            return Ok(RunStep::SkippedLocked);
        };
        let step = self.process_locked(run).await;
        self.locks.release(handle).await;
        step
    }

    async fn process_locked(&self, run: Run) -> Result<RunStep, KernelError> {
        let Some(running) = self.lifecycle.start(&run).await? else {
            let current = self.repo.get_run(&run.id).await?;
            return Ok(match current.map(|r| r.status) {
                Some(RunStatus::Escalated) => RunStep::Escalated,
                _ => RunStep::Abandoned,
            });
        };

        let Some(engine) = self.engines.get(&running.workflow_type) else {
            let error = format!(
                "fatal: no engine registered for workflow type '{}'",
                running.workflow_type
            );
            return self.fail(&running, &error).await;
        };

        let outcome = engine.execute(&RunContext::from_run(&running)).await;

        // Cancellation is observed before any side effect is recorded.
        let Some(current) = self.still_running(&running).await? else {
            tracing::info!(run_id = %running.id, "run_abandoned_after_engine");
            return Ok(RunStep::Abandoned);
        };

        let summary = match outcome {
            Err(err) => return self.fail(&current, &err.to_string()).await,
            Ok(EngineOutcome::Completed { summary }) => summary,
            Ok(EngineOutcome::RaiseException(draft)) => {
                match self
                    .exceptions
                    .raise(RecordOrigin::from_run(&current), draft)
                    .await
                {
                    Ok(record) => json!({
                        "outcome": "exception",
                        "exception_id": record.id,
                        "severity": record.severity,
                    }),
                    Err(err) => return self.fail(&current, &err.to_string()).await,
                }
            }
            Ok(EngineOutcome::ProposeAction(proposal)) => {
                match self
                    .actions
                    .propose(RecordOrigin::from_run(&current), proposal)
                    .await
                {
                    Ok(record) => json!({
                        "outcome": "action",
                        "action_id": record.id,
                        "action_status": record.status,
                    }),
                    Err(err) => return self.fail(&current, &err.to_string()).await,
                }
            }
        };

        match self.lifecycle.complete(&current, summary).await? {
            Some(_) => Ok(RunStep::Completed),
            None => Ok(RunStep::Abandoned),
        }
    }

    async fn still_running(&self, run: &Run) -> Result<Option<Run>, KernelError> {
        let current = self.repo.get_run(&run.id).await?;
        Ok(current.filter(|c| c.status == RunStatus::Running && c.attempts == run.attempts))
    }

    async fn fail(&self, run: &Run, error: &str) -> Result<RunStep, KernelError> {
        Ok(match self.lifecycle.fail(run, error).await? {
            Some(FailureOutcome::Requeued(_)) => RunStep::Requeued,
            Some(FailureOutcome::Escalated(_)) => RunStep::Escalated,
            None => RunStep::Abandoned,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use tenantry_governor::{GovernorPatch, PolicyEngine};
    use tenantry_kernel::{
        CallerIdentity, Clock, InMemoryRepository, ManualClock, NoopNotifier, Severity,
        TriggerType, WorkflowType,
    };

    use super::*;
    use crate::actions::ExecutorRegistry;
    use crate::coordinator::{InMemoryCoordinator, KeySpace};
    use crate::engine::{EngineError, ExceptionDraft, WorkflowEngine};

    struct Scripted {
        tag: &'static str,
        calls: AtomicUsize,
        outcome: fn(usize) -> Result<EngineOutcome, EngineError>,
    }

    #[async_trait]
    impl WorkflowEngine for Scripted {
        fn workflow_type(&self) -> WorkflowType {
            WorkflowType::from(self.tag)
        }

        async fn execute(&self, _ctx: &RunContext) -> Result<EngineOutcome, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(call)
        }
    }

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        coordinator: Arc<InMemoryCoordinator>,
        locks: Arc<LockManager>,
        governor: Arc<SafetyGovernor>,
        worker: Worker,
    }

    fn fixture(engines: EngineRegistry) -> Fixture {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let repo = Arc::new(InMemoryRepository::new());
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let locks = Arc::new(LockManager::new(
            coordinator.clone(),
            KeySpace::new("test"),
            clock.clone(),
        ));
        let governor = Arc::new(SafetyGovernor::new(repo.clone(), clock.clone()));
        let policy = Arc::new(PolicyEngine::new(repo.clone(), clock.clone()));
        let actions = Arc::new(ActionService::new(
            repo.clone(),
            policy,
            governor.clone(),
            locks.clone(),
            ExecutorRegistry::new(),
            Arc::new(NoopNotifier),
            clock.clone(),
        ));
        let exceptions = Arc::new(ExceptionService::new(
            repo.clone(),
            Arc::new(NoopNotifier),
            clock.clone(),
        ));
        let worker = Worker::new(
            repo.clone(),
            Arc::new(RunLifecycle::new(repo.clone(), clock.clone())),
            locks.clone(),
            coordinator.clone(),
            governor.clone(),
            engines,
            actions,
            exceptions,
            clock.clone(),
        );
        Fixture {
            repo,
            clock,
            coordinator,
            locks,
            governor,
            worker,
        }
    }

    fn engine(
        tag: &'static str,
        outcome: fn(usize) -> Result<EngineOutcome, EngineError>,
    ) -> Arc<Scripted> {
        Arc::new(Scripted {
            tag,
            calls: AtomicUsize::new(0),
            outcome,
        })
    }

    async fn enqueue(f: &Fixture, tag: &str, manager: &str) -> Run {
        let run = Run::pending(tag, manager, TriggerType::Manual, f.clock.now());
        f.repo.insert_run(&run).await.unwrap();
        run
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(clamp_batch_size(0), 1);
        assert_eq!(clamp_batch_size(20), 20);
        assert_eq!(clamp_batch_size(500), MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn flaky_engine_is_retried_then_completes() {
        let flaky = engine("PM_DUE", |call| {
            if call == 0 {
                Err(EngineError::Transient("vendor api timeout".into()))
            } else {
                Ok(EngineOutcome::Completed {
                    summary: json!({"reminders": 2}),
                })
            }
        });
        let f = fixture(EngineRegistry::new().with(flaky));
        let run = enqueue(&f, "PM_DUE", "mgr-1").await;

        let first = f.worker.run_batch(20).await.unwrap();
        assert_eq!((first.picked, first.requeued), (1, 1));
        let second = f.worker.run_batch(20).await.unwrap();
        assert_eq!(second.completed, 1);

        let done = f.repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.summary["reminders"], json!(2));
    }

    #[tokio::test]
    async fn exception_outcome_completes_the_run() {
        let raiser = engine("COMPLIANCE_SCAN", |_| {
            Ok(EngineOutcome::RaiseException(ExceptionDraft {
                severity: Severity::High,
                category: "compliance".into(),
                title: "Permit expiring".into(),
                details: String::new(),
                context: json!({}),
                requires_by: None,
            }))
        });
        let f = fixture(EngineRegistry::new().with(raiser));
        let run = enqueue(&f, "COMPLIANCE_SCAN", "mgr-1").await;
        f.worker.run_batch(5).await.unwrap();

        let done = f.repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.summary["outcome"], json!("exception"));
        let exception_id = done.summary["exception_id"].as_str().unwrap();
        let record = f.repo.get_exception(exception_id).await.unwrap().unwrap();
        assert_eq!(record.run_id.as_deref(), Some(run.id.as_str()));
    }

    #[tokio::test]
    async fn missing_engine_escalates_after_max_attempts() {
        let f = fixture(EngineRegistry::new());
        let run = enqueue(&f, "UNKNOWN", "mgr-1").await;
        for _ in 0..3 {
            f.worker.run_batch(20).await.unwrap();
        }
        let dead = f.repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(dead.status, RunStatus::Escalated);
        assert!(dead.is_dead_lettered());
        assert!(dead.error.unwrap().contains("no engine registered"));
    }

    #[tokio::test]
    async fn held_manager_lock_skips_the_run() {
        let ok = engine("PM_DUE", |_| {
            Ok(EngineOutcome::Completed {
                summary: json!({}),
            })
        });
        let f = fixture(EngineRegistry::new().with(ok));
        let run = enqueue(&f, "PM_DUE", "mgr-1").await;
        let held = f
            .locks
            .acquire(&LockManager::manager_subject("mgr-1"))
            .await
            .unwrap();

        let report = f.worker.run_batch(20).await.unwrap();
        assert_eq!(report.skipped_locked, 1);
        let untouched = f.repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!((untouched.status, untouched.attempts), (RunStatus::Pending, 0));

        f.locks.release(held).await;
        assert_eq!(f.worker.run_batch(20).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn blocked_governor_processes_nothing() {
        let ok = engine("PM_DUE", |_| {
            Ok(EngineOutcome::Completed {
                summary: json!({}),
            })
        });
        let f = fixture(EngineRegistry::new().with(ok));
        enqueue(&f, "PM_DUE", "mgr-1").await;
        f.governor
            .patch(
                &CallerIdentity::admin("root"),
                &GovernorPatch {
                    kill_switch: Some(true),
                    ..GovernorPatch::default()
                },
            )
            .await
            .unwrap();
        let report = f.worker.run_batch(20).await.unwrap();
        assert!(report.governor_blocked);
        assert_eq!(report.picked, 0);
    }

    #[tokio::test]
    async fn stale_running_runs_are_recovered_first() {
        let ok = engine("PM_DUE", |_| {
            Ok(EngineOutcome::Completed {
                summary: json!({}),
            })
        });
        let f = fixture(EngineRegistry::new().with(ok));
        let run = enqueue(&f, "PM_DUE", "mgr-1").await;
        let lifecycle = RunLifecycle::new(f.repo.clone(), f.clock.clone());
        lifecycle.start(&run).await.unwrap().unwrap();

        f.clock.advance(f.locks.default_ttl() + Duration::seconds(1));
        let report = f.worker.run_batch(20).await.unwrap();
        assert_eq!(report.stale_requeued, 1);
        assert_eq!(report.completed, 1);
        let done = f.repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!((done.status, done.attempts), (RunStatus::Completed, 2));
    }

    #[tokio::test]
    async fn tick_purges_expired_coordinator_keys_even_when_blocked() {
        let f = fixture(EngineRegistry::new());
        let now = f.clock.now();
        f.coordinator
            .set_if_absent("test:replay:events:e-1", "1", Duration::hours(1), now)
            .await
            .unwrap();
        f.coordinator
            .incr_window("test:ratelimit:list:mgr-1", Duration::minutes(1), now)
            .await
            .unwrap();
        f.coordinator
            .set_if_absent("test:replay:events:e-2", "1", Duration::hours(3), now)
            .await
            .unwrap();
        f.governor
            .patch(
                &CallerIdentity::admin("root"),
                &GovernorPatch {
                    kill_switch: Some(true),
                    ..GovernorPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(f.worker.run_batch(20).await.unwrap().expired_keys_purged, 0);
        assert_eq!(f.coordinator.len(), 3);

        f.clock.advance(Duration::hours(2));
        let report = f.worker.run_batch(20).await.unwrap();
        assert!(report.governor_blocked);
        assert_eq!(report.expired_keys_purged, 2);
        assert_eq!(f.coordinator.len(), 1);
    }
}
