//! Action proposal, approval and guarded execution.
//!
//! ```text
//! propose --policy deny--------------------------> REJECTED
//! propose --autonomy allowed, governor clear-----> APPROVED --execute--> EXECUTED | FAILED
//! propose --otherwise----------------------------> PENDING_APPROVAL
//! PENDING_APPROVAL --approve--> APPROVED --execute--> EXECUTED | FAILED
//! PENDING_APPROVAL --reject---> REJECTED
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tenantry_governor::{PolicyEngine, SafetyGovernor};
use tenantry_kernel::{
    new_id, ActionQuery, ActionRecord, ActionStatus, CallerIdentity, KernelError, Notification,
    Notifier, OpsRepository, SharedClock,
};

use crate::engine::{ActionProposal, RecordOrigin};
use crate::lock::LockManager;

/// `decided_by` for decisions made without a human.
pub const POLICY_DECIDER: &str = "policy";
pub const AUTOPILOT_DECIDER: &str = "autopilot";

/// Performs one action type against the outside world. Executions are
/// serialized per action id, but an executor may still be retried after a
/// crash and should tolerate repeats.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn action_type(&self) -> &str;

    async fn execute(&self, action: &ActionRecord) -> Result<Value, KernelError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) -> &mut Self {
        self.executors
            .insert(executor.action_type().to_string(), executor);
        self
    }

    pub fn with(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(action_type).cloned()
    }
}

pub struct ActionService {
    repo: Arc<dyn OpsRepository>,
    policy: Arc<PolicyEngine>,
    governor: Arc<SafetyGovernor>,
    locks: Arc<LockManager>,
    executors: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
}

impl ActionService {
    pub fn new(
        repo: Arc<dyn OpsRepository>,
        policy: Arc<PolicyEngine>,
        governor: Arc<SafetyGovernor>,
        locks: Arc<LockManager>,
        executors: ExecutorRegistry,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            policy,
            governor,
            locks,
            executors,
            notifier,
            clock,
        }
    }

    /// Records a proposal and decides its first status. Autonomous
    /// execution needs policy allowance, the manager's opt-in and a clear
    /// governor; anything short of that waits for a human.
    pub async fn propose(
        &self,
        origin: RecordOrigin,
        proposal: ActionProposal,
    ) -> Result<ActionRecord, KernelError> {
        if proposal.action_type.trim().is_empty() {
            return Err(KernelError::Validation("action_type is required".into()));
        }
        let decision = self
            .policy
            .evaluate(
                origin.property_id.as_deref(),
                &proposal.action_type,
                &proposal.policy_context,
            )
            .await?;

        let (status, decided_by, reason) = if !decision.allowed {
            (ActionStatus::Rejected, Some(POLICY_DECIDER), decision.reason)
        } else if decision.permits_autonomy() {
            let settings = self.repo.operator_settings(&origin.manager_id).await?;
            let block = self.governor.block_reason().await?;
            match (settings.permits(&proposal.action_type), block) {
                (true, None) => (
                    ActionStatus::Approved,
                    Some(AUTOPILOT_DECIDER),
                    decision.reason,
                ),
                (false, _) => (
                    ActionStatus::PendingApproval,
                    None,
                    "autonomy not enabled for this action type".to_string(),
                ),
                (true, Some(block)) => (ActionStatus::PendingApproval, None, block),
            }
        } else {
            (ActionStatus::PendingApproval, None, decision.reason)
        };

        let now = self.clock.now();
        let record = ActionRecord {
            id: new_id("act"),
            manager_id: origin.manager_id,
            property_id: origin.property_id,
            run_id: origin.run_id,
            action_type: proposal.action_type,
            status,
            payload: proposal.payload,
            result: None,
            entity_type: proposal.entity_type,
            entity_id: proposal.entity_id,
            decision_reason: Some(reason),
            decided_by: decided_by.map(str::to_string),
            created_at: now,
            updated_at: now,
            executed_at: None,
        };
        self.repo.insert_action(&record).await?;
        tracing::info!(
            action_id = %record.id,
            action_type = %record.action_type,
            manager_id = %record.manager_id,
            status = record.status.as_str(),
            reason = record.decision_reason.as_deref().unwrap_or(""),
            "action_proposed"
        );

        match record.status {
            ActionStatus::Approved => self.execute(&record.id).await,
            ActionStatus::PendingApproval => {
                self.notify_pending(&record);
                Ok(record)
            }
            _ => Ok(record),
        }
    }

    fn notify_pending(&self, record: &ActionRecord) {
        let notifier = self.notifier.clone();
        let notification = Notification::new(
            record.manager_id.clone(),
            "action_pending_approval",
            format!("Approval needed: {}", record.action_type),
            json!({
                "action_id": record.id,
                "reason": record.decision_reason,
            }),
        );
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(notification).await {
                tracing::warn!(error = %err, "action_notification_failed");
            }
        });
    }

    async fn visible(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ActionRecord, KernelError> {
        match self.repo.get_action(id).await? {
            Some(record) if caller.can_access(&record.manager_id) => Ok(record),
            _ => Err(KernelError::not_found("action", id)),
        }
    }

    pub async fn get(&self, caller: &CallerIdentity, id: &str) -> Result<ActionRecord, KernelError> {
        self.visible(caller, id).await
    }

    /// Human approval. Executes immediately; the governor only gates
    /// autonomous decisions.
    pub async fn approve(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ActionRecord, KernelError> {
        self.decide(caller, id, ActionStatus::Approved, None).await?;
        self.execute(id).await
    }

    pub async fn reject(
        &self,
        caller: &CallerIdentity,
        id: &str,
        reason: Option<String>,
    ) -> Result<ActionRecord, KernelError> {
        self.decide(caller, id, ActionStatus::Rejected, reason).await
    }

    async fn decide(
        &self,
        caller: &CallerIdentity,
        id: &str,
        status: ActionStatus,
        reason: Option<String>,
    ) -> Result<ActionRecord, KernelError> {
        let current = self.visible(caller, id).await?;
        if current.status != ActionStatus::PendingApproval {
            return Err(KernelError::Conflict(format!(
                "action '{}' is {}, not PENDING_APPROVAL",
                id,
                current.status.as_str()
            )));
        }
        let mut next = current.clone();
        next.status = status;
        next.decided_by = Some(caller.id.clone());
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            next.decision_reason = Some(reason);
        }
        next.updated_at = self.clock.now();
        if !self
            .repo
            .compare_and_swap_action(ActionStatus::PendingApproval, &next)
            .await?
        {
            return Err(KernelError::Conflict(format!(
                "action '{}' changed concurrently",
                id
            )));
        }
        tracing::info!(
            action_id = %id,
            status = next.status.as_str(),
            by = %caller.id,
            "action_decided"
        );
        Ok(next)
    }

    /// Caller-scoped retry of an APPROVED action whose execution did not
    /// happen, e.g. because the action lock could not be taken.
    pub async fn retry_execution(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<ActionRecord, KernelError> {
        self.visible(caller, id).await?;
        let record = self.execute(id).await?;
        tracing::info!(
            action_id = %id,
            status = record.status.as_str(),
            by = %caller.id,
            "action_execution_retried"
        );
        Ok(record)
    }

    /// Runs the executor for an APPROVED action under the action-id lock.
    /// A second concurrent execution gets `Conflict` instead of running.
    pub async fn execute(&self, id: &str) -> Result<ActionRecord, KernelError> {
        let Some(handle) = self
            .locks
            .acquire(&LockManager::action_subject(id))
            .await
        else {
            return Err(KernelError::Conflict(format!(
                "action '{}' is already executing",
                id
            )));
        };
        let result = self.execute_locked(id).await;
        self.locks.release(handle).await;
        result
    }

    async fn execute_locked(&self, id: &str) -> Result<ActionRecord, KernelError> {
        let current = self
            .repo
            .get_action(id)
            .await?
            .ok_or_else(|| KernelError::not_found("action", id))?;
        match current.status {
            ActionStatus::Executed => return Ok(current),
            ActionStatus::Approved => {}
            other => {
                return Err(KernelError::Conflict(format!(
                    "action '{}' is {}, not APPROVED",
                    id,
                    other.as_str()
                )))
            }
        }

        let outcome = match self.executors.get(&current.action_type) {
            Some(executor) => executor.execute(&current).await,
            None => Err(KernelError::Misconfigured(format!(
                "no executor registered for action type '{}'",
                current.action_type
            ))),
        };

        let now = self.clock.now();
        let mut next = current.clone();
        next.updated_at = now;
        match outcome {
            Ok(result) => {
                next.status = ActionStatus::Executed;
                next.result = Some(result);
                next.executed_at = Some(now);
            }
            Err(err) => {
                next.status = ActionStatus::Failed;
                next.result = Some(json!({ "error": err.to_string() }));
            }
        }
        if !self
            .repo
            .compare_and_swap_action(ActionStatus::Approved, &next)
            .await?
        {
            return Err(KernelError::Conflict(format!(
                "action '{}' changed while executing",
                id
            )));
        }
        if next.status == ActionStatus::Executed {
            tracing::info!(action_id = %id, action_type = %next.action_type, "action_executed");
        } else {
            tracing::warn!(
                action_id = %id,
                action_type = %next.action_type,
                result = %next.result.clone().unwrap_or(serde_json::Value::Null),
                "action_failed"
            );
        }
        Ok(next)
    }

    pub async fn list(
        &self,
        caller: &CallerIdentity,
        mut query: ActionQuery,
    ) -> Result<Vec<ActionRecord>, KernelError> {
        if !caller.is_admin() {
            query.manager_id = Some(caller.id.clone());
        }
        self.repo.list_actions(&query).await
    }
}
