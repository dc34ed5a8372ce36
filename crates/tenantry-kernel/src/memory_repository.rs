//! Process-local [OpsRepository] used by tests and single-process
//! development deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KernelError;
use crate::identity::new_id;
use crate::models::{
    is_cancellation, ActionQuery, ActionRecord, ActionStatus, ExceptionQuery, ExceptionRecord,
    ExceptionStatus, GovernorState, NewPolicy, OperatorSettings, PolicyRecord, PolicyScope, Run,
    RunOrder, RunQuery, RunStats, RunStatus, Severity,
};
use crate::repository::OpsRepository;

#[derive(Default)]
struct State {
    // insertion order doubles as the tie-breaker for equal timestamps
    runs: Vec<Run>,
    exceptions: Vec<ExceptionRecord>,
    actions: Vec<ActionRecord>,
    policies: Vec<PolicyRecord>,
    governor: Option<GovernorState>,
    settings: HashMap<String, OperatorSettings>,
}

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_limit<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if limit > 0 {
        items.truncate(limit);
    }
    items
}

#[async_trait]
impl OpsRepository for InMemoryRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), KernelError> {
        let mut state = self.state();
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(KernelError::Conflict(format!("run '{}' already exists", run.id)));
        }
        if let Some(trigger_ref) = &run.trigger_ref {
            if state
                .runs
                .iter()
                .any(|r| r.trigger_ref.as_ref() == Some(trigger_ref))
            {
                return Err(KernelError::Conflict(format!(
                    "trigger_ref '{}' already enqueued",
                    trigger_ref
                )));
            }
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, KernelError> {
        Ok(self.state().runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn find_run_by_trigger_ref(
        &self,
        trigger_ref: &str,
    ) -> Result<Option<Run>, KernelError> {
        Ok(self
            .state()
            .runs
            .iter()
            .find(|r| r.trigger_ref.as_deref() == Some(trigger_ref))
            .cloned())
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, KernelError> {
        let mut runs: Vec<Run> = self
            .state()
            .runs
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        // stable sort keeps insertion order among equal timestamps
        runs.sort_by_key(|r| r.created_at);
        if query.order == RunOrder::NewestFirst {
            runs.reverse();
        }
        Ok(apply_limit(runs, query.limit))
    }

    async fn compare_and_swap_run(
        &self,
        expected_status: RunStatus,
        expected_attempts: u32,
        next: &Run,
    ) -> Result<bool, KernelError> {
        let mut state = self.state();
        let Some(current) = state.runs.iter_mut().find(|r| r.id == next.id) else {
            return Err(KernelError::not_found("run", &next.id));
        };
        if current.status != expected_status || current.attempts != expected_attempts {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }

    async fn run_stats_since(&self, since: DateTime<Utc>) -> Result<RunStats, KernelError> {
        let state = self.state();
        let mut stats = RunStats::default();
        for run in state.runs.iter().filter(|r| r.created_at >= since) {
            stats.total += 1;
            let failed = match run.status {
                RunStatus::Escalated => true,
                RunStatus::Failed => !is_cancellation(run),
                _ => false,
            };
            if failed {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<(), KernelError> {
        let mut state = self.state();
        if state.exceptions.iter().any(|e| e.id == record.id) {
            return Err(KernelError::Conflict(format!(
                "exception '{}' already exists",
                record.id
            )));
        }
        state.exceptions.push(record.clone());
        Ok(())
    }

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, KernelError> {
        Ok(self.state().exceptions.iter().find(|e| e.id == id).cloned())
    }

    async fn compare_and_swap_exception(
        &self,
        expected_status: ExceptionStatus,
        next: &ExceptionRecord,
    ) -> Result<bool, KernelError> {
        let mut state = self.state();
        let Some(current) = state.exceptions.iter_mut().find(|e| e.id == next.id) else {
            return Err(KernelError::not_found("exception", &next.id));
        };
        if current.status != expected_status {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }

    async fn list_exceptions(
        &self,
        query: &ExceptionQuery,
    ) -> Result<Vec<ExceptionRecord>, KernelError> {
        let mut records: Vec<ExceptionRecord> = self
            .state()
            .exceptions
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        // most urgent first
        records.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.requires_by.cmp(&b.requires_by))
        });
        Ok(apply_limit(records, query.limit))
    }

    async fn count_open_critical_since(&self, since: DateTime<Utc>) -> Result<u64, KernelError> {
        Ok(self
            .state()
            .exceptions
            .iter()
            .filter(|e| {
                e.status == ExceptionStatus::Open
                    && e.severity == Severity::Critical
                    && e.created_at >= since
            })
            .count() as u64)
    }

    async fn insert_action(&self, record: &ActionRecord) -> Result<(), KernelError> {
        let mut state = self.state();
        if state.actions.iter().any(|a| a.id == record.id) {
            return Err(KernelError::Conflict(format!(
                "action '{}' already exists",
                record.id
            )));
        }
        state.actions.push(record.clone());
        Ok(())
    }

    async fn get_action(&self, id: &str) -> Result<Option<ActionRecord>, KernelError> {
        Ok(self.state().actions.iter().find(|a| a.id == id).cloned())
    }

    async fn compare_and_swap_action(
        &self,
        expected_status: ActionStatus,
        next: &ActionRecord,
    ) -> Result<bool, KernelError> {
        let mut state = self.state();
        let Some(current) = state.actions.iter_mut().find(|a| a.id == next.id) else {
            return Err(KernelError::not_found("action", &next.id));
        };
        if current.status != expected_status {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }

    async fn list_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>, KernelError> {
        let mut records: Vec<ActionRecord> = self
            .state()
            .actions
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        records.reverse();
        Ok(apply_limit(records, query.limit))
    }

    async fn create_policy(
        &self,
        draft: &NewPolicy,
        now: DateTime<Utc>,
    ) -> Result<PolicyRecord, KernelError> {
        draft.scope.validate()?;
        let mut state = self.state();
        let mut count = 0u32;
        for policy in state.policies.iter_mut().filter(|p| p.scope == draft.scope) {
            count += 1;
            policy.is_active = false;
        }
        let record = PolicyRecord {
            id: new_id("pol"),
            scope: draft.scope.clone(),
            config: draft.config.clone(),
            version: count + 1,
            is_active: true,
            created_by: draft.created_by.clone(),
            created_at: now,
        };
        state.policies.push(record.clone());
        Ok(record)
    }

    async fn active_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<PolicyRecord>, KernelError> {
        Ok(self
            .state()
            .policies
            .iter()
            .find(|p| p.is_active && &p.scope == scope)
            .cloned())
    }

    async fn policy_history(&self, scope: &PolicyScope) -> Result<Vec<PolicyRecord>, KernelError> {
        let mut history: Vec<PolicyRecord> = self
            .state()
            .policies
            .iter()
            .filter(|p| &p.scope == scope)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(history)
    }

    async fn load_governor(&self) -> Result<GovernorState, KernelError> {
        Ok(self.state().governor.clone().unwrap_or_default())
    }

    async fn compare_and_swap_governor(
        &self,
        expected_version: u64,
        next: &GovernorState,
    ) -> Result<bool, KernelError> {
        let mut state = self.state();
        let current_version = state.governor.as_ref().map(|g| g.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        state.governor = Some(next.clone());
        Ok(true)
    }

    async fn operator_settings(&self, manager_id: &str) -> Result<OperatorSettings, KernelError> {
        Ok(self
            .state()
            .settings
            .get(manager_id)
            .cloned()
            .unwrap_or_else(|| OperatorSettings::disabled(manager_id)))
    }

    async fn put_operator_settings(&self, settings: &OperatorSettings) -> Result<(), KernelError> {
        self.state()
            .settings
            .insert(settings.manager_id.clone(), settings.clone());
        Ok(())
    }
}
