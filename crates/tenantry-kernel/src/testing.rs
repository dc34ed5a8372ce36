//! Test doubles for code built on [OpsRepository].
//!
//! Enabled for dependents through the `test-util` feature.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KernelError;
use crate::memory_repository::InMemoryRepository;
use crate::models::{
    ActionQuery, ActionRecord, ActionStatus, ExceptionQuery, ExceptionRecord, ExceptionStatus,
    GovernorState, NewPolicy, OperatorSettings, PolicyRecord, PolicyScope, Run, RunQuery,
    RunStats, RunStatus,
};
use crate::repository::OpsRepository;

/// [InMemoryRepository] that answers the next `n` calls of a named
/// operation with [KernelError::Store].
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryRepository,
    failures: Mutex<HashMap<String, u32>>,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            failures: Mutex::default(),
        }
    }

    pub fn inner(&self) -> &InMemoryRepository {
        &self.inner
    }

    /// `op` is the trait method name, e.g. `"insert_run"`.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op.to_string(), times);
    }

    fn check(&self, op: &str) -> Result<(), KernelError> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(KernelError::Store(format!("{}: injected outage", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl OpsRepository for FlakyRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), KernelError> {
        self.check("insert_run")?;
        self.inner.insert_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, KernelError> {
        self.check("get_run")?;
        self.inner.get_run(run_id).await
    }

    async fn find_run_by_trigger_ref(
        &self,
        trigger_ref: &str,
    ) -> Result<Option<Run>, KernelError> {
        self.check("find_run_by_trigger_ref")?;
        self.inner.find_run_by_trigger_ref(trigger_ref).await
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, KernelError> {
        self.check("list_runs")?;
        self.inner.list_runs(query).await
    }

    async fn compare_and_swap_run(
        &self,
        expected_status: RunStatus,
        expected_attempts: u32,
        next: &Run,
    ) -> Result<bool, KernelError> {
        self.check("compare_and_swap_run")?;
        self.inner
            .compare_and_swap_run(expected_status, expected_attempts, next)
            .await
    }

    async fn run_stats_since(&self, since: DateTime<Utc>) -> Result<RunStats, KernelError> {
        self.check("run_stats_since")?;
        self.inner.run_stats_since(since).await
    }

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<(), KernelError> {
        self.check("insert_exception")?;
        self.inner.insert_exception(record).await
    }

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, KernelError> {
        self.check("get_exception")?;
        self.inner.get_exception(id).await
    }

    async fn compare_and_swap_exception(
        &self,
        expected_status: ExceptionStatus,
        next: &ExceptionRecord,
    ) -> Result<bool, KernelError> {
        self.check("compare_and_swap_exception")?;
        self.inner
            .compare_and_swap_exception(expected_status, next)
            .await
    }

    async fn list_exceptions(
        &self,
        query: &ExceptionQuery,
    ) -> Result<Vec<ExceptionRecord>, KernelError> {
        self.check("list_exceptions")?;
        self.inner.list_exceptions(query).await
    }

    async fn count_open_critical_since(&self, since: DateTime<Utc>) -> Result<u64, KernelError> {
        self.check("count_open_critical_since")?;
        self.inner.count_open_critical_since(since).await
    }

    async fn insert_action(&self, record: &ActionRecord) -> Result<(), KernelError> {
        self.check("insert_action")?;
        self.inner.insert_action(record).await
    }

    async fn get_action(&self, id: &str) -> Result<Option<ActionRecord>, KernelError> {
        self.check("get_action")?;
        self.inner.get_action(id).await
    }

    async fn compare_and_swap_action(
        &self,
        expected_status: ActionStatus,
        next: &ActionRecord,
    ) -> Result<bool, KernelError> {
        self.check("compare_and_swap_action")?;
        self.inner.compare_and_swap_action(expected_status, next).await
    }

    async fn list_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>, KernelError> {
        self.check("list_actions")?;
        self.inner.list_actions(query).await
    }

    async fn create_policy(
        &self,
        draft: &NewPolicy,
        now: DateTime<Utc>,
    ) -> Result<PolicyRecord, KernelError> {
        self.check("create_policy")?;
        self.inner.create_policy(draft, now).await
    }

    async fn active_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<PolicyRecord>, KernelError> {
        self.check("active_policy")?;
        self.inner.active_policy(scope).await
    }

    async fn policy_history(&self, scope: &PolicyScope) -> Result<Vec<PolicyRecord>, KernelError> {
        self.check("policy_history")?;
        self.inner.policy_history(scope).await
    }

    async fn load_governor(&self) -> Result<GovernorState, KernelError> {
        self.check("load_governor")?;
        self.inner.load_governor().await
    }

    async fn compare_and_swap_governor(
        &self,
        expected_version: u64,
        next: &GovernorState,
    ) -> Result<bool, KernelError> {
        self.check("compare_and_swap_governor")?;
        self.inner
            .compare_and_swap_governor(expected_version, next)
            .await
    }

    async fn operator_settings(&self, manager_id: &str) -> Result<OperatorSettings, KernelError> {
        self.check("operator_settings")?;
        self.inner.operator_settings(manager_id).await
    }

    async fn put_operator_settings(&self, settings: &OperatorSettings) -> Result<(), KernelError> {
        self.check("put_operator_settings")?;
        self.inner.put_operator_settings(settings).await
    }
}
