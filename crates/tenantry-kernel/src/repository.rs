//! Persistence contract for the control plane records.
//!
//! Every mutation of a shared record is a compare-and-swap: the caller
//! states what it last observed and the store refuses the write if another
//! invocation got there first. Backends never hold locks across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KernelError;
use crate::models::{
    ActionQuery, ActionRecord, ActionStatus, ExceptionQuery, ExceptionRecord, ExceptionStatus,
    GovernorState, NewPolicy, OperatorSettings, PolicyRecord, PolicyScope, Run, RunQuery,
    RunStats, RunStatus,
};

#[async_trait]
pub trait OpsRepository: Send + Sync {
    // runs

    /// Inserts a new run. A run whose `trigger_ref` is already taken is
    /// rejected with [KernelError::Conflict].
    async fn insert_run(&self, run: &Run) -> Result<(), KernelError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, KernelError>;

    async fn find_run_by_trigger_ref(&self, trigger_ref: &str)
        -> Result<Option<Run>, KernelError>;

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, KernelError>;

    /// Replaces the stored run with `next` iff its status and attempts still
    /// equal the expected values. Returns whether the swap happened.
    async fn compare_and_swap_run(
        &self,
        expected_status: RunStatus,
        expected_attempts: u32,
        next: &Run,
    ) -> Result<bool, KernelError>;

    /// Runs created at or after `since`.
    async fn run_stats_since(&self, since: DateTime<Utc>) -> Result<RunStats, KernelError>;

    // exceptions

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<(), KernelError>;

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, KernelError>;

    async fn compare_and_swap_exception(
        &self,
        expected_status: ExceptionStatus,
        next: &ExceptionRecord,
    ) -> Result<bool, KernelError>;

    async fn list_exceptions(
        &self,
        query: &ExceptionQuery,
    ) -> Result<Vec<ExceptionRecord>, KernelError>;

    /// OPEN CRITICAL exceptions created at or after `since`.
    async fn count_open_critical_since(&self, since: DateTime<Utc>) -> Result<u64, KernelError>;

    // actions

    async fn insert_action(&self, record: &ActionRecord) -> Result<(), KernelError>;

    async fn get_action(&self, id: &str) -> Result<Option<ActionRecord>, KernelError>;

    async fn compare_and_swap_action(
        &self,
        expected_status: ActionStatus,
        next: &ActionRecord,
    ) -> Result<bool, KernelError>;

    async fn list_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>, KernelError>;

    // policies

    /// Atomically deactivates every active policy for the exact scope and
    /// inserts a new active one with version = existing count + 1.
    async fn create_policy(
        &self,
        draft: &NewPolicy,
        now: DateTime<Utc>,
    ) -> Result<PolicyRecord, KernelError>;

    async fn active_policy(&self, scope: &PolicyScope)
        -> Result<Option<PolicyRecord>, KernelError>;

    /// All versions for the scope, newest first.
    async fn policy_history(&self, scope: &PolicyScope) -> Result<Vec<PolicyRecord>, KernelError>;

    // governor

    /// Returns the stored singleton, or the defaults with version 0 when
    /// nothing has been written yet.
    async fn load_governor(&self) -> Result<GovernorState, KernelError>;

    /// Writes `next` (whose version must be `expected_version + 1`) iff the
    /// stored version still equals `expected_version`.
    async fn compare_and_swap_governor(
        &self,
        expected_version: u64,
        next: &GovernorState,
    ) -> Result<bool, KernelError>;

    // operator settings

    /// Settings for a manager, or disabled autonomy when none are stored.
    async fn operator_settings(&self, manager_id: &str) -> Result<OperatorSettings, KernelError>;

    async fn put_operator_settings(&self, settings: &OperatorSettings) -> Result<(), KernelError>;
}
