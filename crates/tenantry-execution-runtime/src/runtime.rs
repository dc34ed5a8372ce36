//! Assembled control plane: every service wired over one repository, one
//! coordinator and one clock, plus the caller-scoped run operations.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use tenantry_governor::{GovernorPatch, PolicyEngine, SafetyGovernor};
use tenantry_kernel::{
    CallerIdentity, DeploymentMode, GovernorState, KernelError, NoopNotifier, Notifier,
    OperatorSettings, OpsRepository, Run, RunQuery, SharedClock, SystemClock,
};

use crate::actions::{ActionService, ExecutorRegistry};
use crate::coordinator::{Coordinator, FallbackCoordinator, KeySpace};
use crate::engine::EngineRegistry;
use crate::exceptions::ExceptionService;
use crate::lifecycle::{ReplayMode, RunLifecycle};
use crate::lock::{LockManager, DEFAULT_LOCK_TTL_SECS};
use crate::publisher::{DomainEvent, EventPublisher, EventRoutes, DEFAULT_EVENT_DEDUP_TTL_SECS};
use crate::rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter, LIST_BUCKET};
use crate::replay::ReplayCache;
use crate::triggers::{
    ManualTriggerRequest, ScheduleTarget, ScheduledTickReport, TriggerOutcome, TriggerService,
    DEFAULT_SCHEDULE_DEDUP_TTL_SECS,
};
use crate::worker::{clamp_batch_size, Worker, WorkerTickReport, DEFAULT_BATCH_SIZE};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub deployment: DeploymentMode,
    pub coordinator_prefix: String,
    pub lock_ttl_secs: i64,
    pub worker_batch_size: usize,
    pub manual_trigger: RateLimitRule,
    pub listing: RateLimitRule,
    pub event_dedup_ttl_secs: i64,
    pub schedule_dedup_ttl_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentMode::Development,
            coordinator_prefix: "tenantry".to_string(),
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            worker_batch_size: DEFAULT_BATCH_SIZE,
            manual_trigger: RateLimitRule::new(10, 60_000),
            listing: RateLimitRule::new(120, 60_000),
            event_dedup_ttl_secs: DEFAULT_EVENT_DEDUP_TTL_SECS,
            schedule_dedup_ttl_secs: DEFAULT_SCHEDULE_DEDUP_TTL_SECS,
        }
    }
}

pub struct OpsRuntimeBuilder {
    config: RuntimeConfig,
    repo: Arc<dyn OpsRepository>,
    coordinator: Arc<dyn Coordinator>,
    clock: SharedClock,
    engines: EngineRegistry,
    executors: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
    routes: EventRoutes,
}

impl OpsRuntimeBuilder {
    pub fn new(repo: Arc<dyn OpsRepository>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            config: RuntimeConfig::default(),
            repo,
            coordinator,
            clock: Arc::new(SystemClock),
            engines: EngineRegistry::new(),
            executors: ExecutorRegistry::new(),
            notifier: Arc::new(NoopNotifier),
            routes: EventRoutes::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn routes(mut self, routes: EventRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn build(self) -> OpsRuntime {
        let Self {
            config,
            repo,
            coordinator,
            clock,
            engines,
            executors,
            notifier,
            routes,
        } = self;
        let mode = config.deployment;
        let coordinator: Arc<dyn Coordinator> =
            Arc::new(FallbackCoordinator::new(coordinator, mode));
        let keys = KeySpace::new(config.coordinator_prefix.clone());

        let locks = Arc::new(
            LockManager::new(coordinator.clone(), keys.clone(), clock.clone())
                .with_default_ttl(Duration::seconds(config.lock_ttl_secs)),
        );
        let replay = Arc::new(ReplayCache::new(coordinator.clone(), keys.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            coordinator.clone(),
            keys,
            clock.clone(),
            mode,
        ));
        let lifecycle = Arc::new(RunLifecycle::new(repo.clone(), clock.clone()));
        let policy = Arc::new(PolicyEngine::new(repo.clone(), clock.clone()));
        let governor = Arc::new(SafetyGovernor::new(repo.clone(), clock.clone()));
        let exceptions = Arc::new(ExceptionService::new(
            repo.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let actions = Arc::new(ActionService::new(
            repo.clone(),
            policy.clone(),
            governor.clone(),
            locks.clone(),
            executors,
            notifier,
            clock.clone(),
        ));
        let triggers = Arc::new(
            TriggerService::new(
                repo.clone(),
                governor.clone(),
                limiter.clone(),
                replay.clone(),
                engines.clone(),
                clock.clone(),
                config.manual_trigger,
                mode.allows_local_fallback(),
            )
            .with_schedule_dedup_ttl(Duration::seconds(config.schedule_dedup_ttl_secs)),
        );
        let publisher = Arc::new(
            EventPublisher::new(repo.clone(), replay.clone(), routes, clock.clone(), mode)
                .with_dedup_ttl(Duration::seconds(config.event_dedup_ttl_secs)),
        );
        let worker = Arc::new(Worker::new(
            repo.clone(),
            lifecycle.clone(),
            locks.clone(),
            coordinator,
            governor.clone(),
            engines,
            actions.clone(),
            exceptions.clone(),
            clock.clone(),
        ));
        tracing::info!(
            deployment = %mode,
            prefix = %config.coordinator_prefix,
            lock_ttl_secs = config.lock_ttl_secs,
            "ops_runtime_ready"
        );
        OpsRuntime {
            config,
            repo,
            clock,
            locks,
            replay,
            limiter,
            lifecycle,
            policy,
            governor,
            actions,
            exceptions,
            triggers,
            publisher,
            worker,
        }
    }
}

pub struct OpsRuntime {
    config: RuntimeConfig,
    repo: Arc<dyn OpsRepository>,
    clock: SharedClock,
    locks: Arc<LockManager>,
    replay: Arc<ReplayCache>,
    limiter: Arc<RateLimiter>,
    lifecycle: Arc<RunLifecycle>,
    policy: Arc<PolicyEngine>,
    governor: Arc<SafetyGovernor>,
    actions: Arc<ActionService>,
    exceptions: Arc<ExceptionService>,
    triggers: Arc<TriggerService>,
    publisher: Arc<EventPublisher>,
    worker: Arc<Worker>,
}

impl OpsRuntime {
    pub fn builder(
        repo: Arc<dyn OpsRepository>,
        coordinator: Arc<dyn Coordinator>,
    ) -> OpsRuntimeBuilder {
        OpsRuntimeBuilder::new(repo, coordinator)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn OpsRepository> {
        &self.repo
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn replay_cache(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn governor(&self) -> &Arc<SafetyGovernor> {
        &self.governor
    }

    pub fn actions(&self) -> &Arc<ActionService> {
        &self.actions
    }

    pub fn exceptions(&self) -> &Arc<ExceptionService> {
        &self.exceptions
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub async fn manual_trigger(
        &self,
        caller: &CallerIdentity,
        request: ManualTriggerRequest,
    ) -> Result<TriggerOutcome, KernelError> {
        self.triggers.manual_trigger(caller, request).await
    }

    pub async fn scheduled_tick(
        &self,
        targets: &[ScheduleTarget],
    ) -> Result<ScheduledTickReport, KernelError> {
        self.triggers.scheduled_tick(targets).await
    }

    /// `None` uses the configured batch size.
    pub async fn worker_tick(
        &self,
        batch_size: Option<usize>,
    ) -> Result<WorkerTickReport, KernelError> {
        let size = clamp_batch_size(batch_size.unwrap_or(self.config.worker_batch_size));
        self.worker.run_batch(size).await
    }

    pub fn publish(&self, event: DomainEvent) -> JoinHandle<()> {
        self.publisher.publish(event)
    }

    /// Counts one listing request against the caller's window.
    pub async fn listing_rate(&self, caller: &CallerIdentity) -> RateLimitDecision {
        self.limiter
            .check_rule(LIST_BUCKET, &caller.id, self.config.listing)
            .await
    }

    pub async fn get_run(&self, caller: &CallerIdentity, run_id: &str) -> Result<Run, KernelError> {
        match self.repo.get_run(run_id).await? {
            Some(run) if caller.can_access(&run.manager_id) => Ok(run),
            _ => Err(KernelError::not_found("run", run_id)),
        }
    }

    /// Managers list their own runs; admins may list any manager's.
    pub async fn list_runs(
        &self,
        caller: &CallerIdentity,
        mut query: RunQuery,
    ) -> Result<Vec<Run>, KernelError> {
        if !caller.is_admin() {
            query.manager_id = Some(caller.id.clone());
        }
        query.limit = match query.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };
        self.repo.list_runs(&query).await
    }

    pub async fn dead_letter(
        &self,
        caller: &CallerIdentity,
        limit: usize,
    ) -> Result<Vec<Run>, KernelError> {
        require_admin(caller, "list the dead-letter queue")?;
        let limit = if limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };
        self.repo.list_runs(&RunQuery::dead_letter(limit)).await
    }

    pub async fn cancel_run(
        &self,
        caller: &CallerIdentity,
        run_id: &str,
        reason: Option<&str>,
    ) -> Result<Run, KernelError> {
        self.get_run(caller, run_id).await?;
        let run = self.lifecycle.cancel(run_id, reason).await?;
        tracing::info!(run_id, by = %caller.id, "run_cancel_requested");
        Ok(run)
    }

    /// Dead-letter replay is always an explicit administrator action.
    pub async fn replay_run(
        &self,
        caller: &CallerIdentity,
        run_id: &str,
        mode: ReplayMode,
    ) -> Result<Run, KernelError> {
        require_admin(caller, "replay runs")?;
        let run = self.lifecycle.replay(run_id, mode).await?;
        tracing::info!(run_id, by = %caller.id, mode = ?mode, "run_replay_requested");
        Ok(run)
    }

    pub async fn governor_state(
        &self,
        caller: &CallerIdentity,
    ) -> Result<GovernorState, KernelError> {
        require_admin(caller, "read the safety governor")?;
        self.governor.state().await
    }

    pub async fn patch_governor(
        &self,
        caller: &CallerIdentity,
        patch: &GovernorPatch,
    ) -> Result<GovernorState, KernelError> {
        self.governor.patch(caller, patch).await
    }

    pub async fn operator_settings(
        &self,
        caller: &CallerIdentity,
        manager_id: &str,
    ) -> Result<OperatorSettings, KernelError> {
        if !caller.can_access(manager_id) {
            return Err(KernelError::Forbidden(
                "managers may only read their own settings".into(),
            ));
        }
        self.repo.operator_settings(manager_id).await
    }

    pub async fn put_operator_settings(
        &self,
        caller: &CallerIdentity,
        mut settings: OperatorSettings,
    ) -> Result<OperatorSettings, KernelError> {
        if !caller.can_access(&settings.manager_id) {
            return Err(KernelError::Forbidden(
                "managers may only change their own settings".into(),
            ));
        }
        settings.updated_at = Some(self.clock.now());
        self.repo.put_operator_settings(&settings).await?;
        tracing::info!(
            manager_id = %settings.manager_id,
            autonomy_enabled = settings.autonomy_enabled,
            by = %caller.id,
            "operator_settings_updated"
        );
        Ok(settings)
    }
}

fn require_admin(caller: &CallerIdentity, what: &str) -> Result<(), KernelError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(KernelError::Forbidden(format!(
            "only administrators may {}",
            what
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use tenantry_kernel::{Clock, InMemoryRepository, ManualClock, RunStatus, TriggerType};

    use super::*;
    use crate::coordinator::InMemoryCoordinator;

    fn runtime() -> (Arc<InMemoryRepository>, Arc<ManualClock>, OpsRuntime) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let repo = Arc::new(InMemoryRepository::new());
        let runtime = OpsRuntime::builder(repo.clone(), Arc::new(InMemoryCoordinator::new()))
            .clock(clock.clone())
            .build();
        (repo, clock, runtime)
    }

    #[tokio::test]
    async fn runs_of_other_managers_are_masked() {
        let (repo, clock, runtime) = runtime();
        let run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, clock.now());
        repo.insert_run(&run).await.unwrap();

        let stranger = CallerIdentity::manager("mgr-2");
        assert!(matches!(
            runtime.get_run(&stranger, &run.id).await,
            Err(KernelError::NotFound(_))
        ));
        assert!(matches!(
            runtime.cancel_run(&stranger, &run.id, None).await,
            Err(KernelError::NotFound(_))
        ));
        assert!(runtime
            .list_runs(&stranger, RunQuery::default())
            .await
            .unwrap()
            .is_empty());

        let owner = CallerIdentity::manager("mgr-1");
        let cancelled = runtime
            .cancel_run(&owner, &run.id, Some("duplicate request"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, RunStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled: duplicate request"));
    }

    #[tokio::test]
    async fn admin_only_operations() {
        let (_repo, _clock, runtime) = runtime();
        let manager = CallerIdentity::manager("mgr-1");
        assert!(matches!(
            runtime.dead_letter(&manager, 10).await,
            Err(KernelError::Forbidden(_))
        ));
        assert!(matches!(
            runtime
                .replay_run(&manager, "run-x", ReplayMode::default())
                .await,
            Err(KernelError::Forbidden(_))
        ));
        assert!(matches!(
            runtime.governor_state(&manager).await,
            Err(KernelError::Forbidden(_))
        ));
        assert!(runtime
            .dead_letter(&CallerIdentity::admin("root"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn settings_are_scoped_to_their_manager() {
        let (_repo, _clock, runtime) = runtime();
        let owner = CallerIdentity::manager("mgr-1");
        let mut settings = runtime.operator_settings(&owner, "mgr-1").await.unwrap();
        assert!(!settings.autonomy_enabled);
        settings.autonomy_enabled = true;
        let saved = runtime.put_operator_settings(&owner, settings).await.unwrap();
        assert!(saved.updated_at.is_some());

        let stranger = CallerIdentity::manager("mgr-2");
        assert!(matches!(
            runtime.operator_settings(&stranger, "mgr-1").await,
            Err(KernelError::Forbidden(_))
        ));
    }
}
