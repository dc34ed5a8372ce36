//! Workflow engines: one handler per workflow type, selected by tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tenantry_governor::PolicyContext;
use tenantry_kernel::{ManagerId, PropertyId, Run, RunId, Severity, TriggerType, WorkflowType};

/// What an engine sees of the run it executes.
#[derive(Clone, Debug, PartialEq)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow_type: WorkflowType,
    pub manager_id: ManagerId,
    pub property_id: Option<PropertyId>,
    pub payload: Value,
    pub attempt: u32,
    pub trigger_type: TriggerType,
    pub trigger_ref: Option<String>,
}

impl RunContext {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            workflow_type: run.workflow_type.clone(),
            manager_id: run.manager_id.clone(),
            property_id: run.property_id.clone(),
            payload: run.payload.clone(),
            attempt: run.attempts,
            trigger_type: run.trigger_type,
            trigger_ref: run.trigger_ref.clone(),
        }
    }
}

/// Owner scope and provenance of a record created on behalf of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordOrigin {
    pub manager_id: ManagerId,
    pub property_id: Option<PropertyId>,
    pub run_id: Option<RunId>,
}

impl RecordOrigin {
    pub fn from_run(run: &Run) -> Self {
        Self {
            manager_id: run.manager_id.clone(),
            property_id: run.property_id.clone(),
            run_id: Some(run.id.clone()),
        }
    }
}

/// A human-review item an engine wants raised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDraft {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub context: Value,
    /// Defaults from severity when absent.
    #[serde(default)]
    pub requires_by: Option<DateTime<Utc>>,
}

/// A side-effecting operation an engine wants performed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Facts the policy engine checks rule predicates against.
    #[serde(default)]
    pub policy_context: PolicyContext,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutcome {
    Completed { summary: Value },
    RaiseException(ExceptionDraft),
    ProposeAction(ActionProposal),
}

/// Engine failures. Both kinds drive retry-or-escalate; the distinction is
/// kept for logs and the stored error text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Engine bodies may run more than once for the same run (retries, stale
/// requeue), so their side effects must be idempotent or guarded.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    fn workflow_type(&self) -> WorkflowType;

    /// Whether the scheduled trigger enqueues this workflow.
    fn scheduled(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &RunContext) -> Result<EngineOutcome, EngineError>;
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<WorkflowType, Arc<dyn WorkflowEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine under its own tag, replacing any previous one.
    pub fn register(&mut self, engine: Arc<dyn WorkflowEngine>) -> &mut Self {
        self.engines.insert(engine.workflow_type(), engine);
        self
    }

    pub fn with(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.register(engine);
        self
    }

    pub fn get(&self, workflow_type: &WorkflowType) -> Option<Arc<dyn WorkflowEngine>> {
        self.engines.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &WorkflowType) -> bool {
        self.engines.contains_key(workflow_type)
    }

    pub fn workflow_types(&self) -> Vec<WorkflowType> {
        let mut types: Vec<WorkflowType> = self.engines.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn scheduled_types(&self) -> Vec<WorkflowType> {
        let mut types: Vec<WorkflowType> = self
            .engines
            .values()
            .filter(|e| e.scheduled())
            .map(|e| e.workflow_type())
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Fixed(&'static str, bool);

    #[async_trait]
    impl WorkflowEngine for Fixed {
        fn workflow_type(&self) -> WorkflowType {
            WorkflowType::from(self.0)
        }

        fn scheduled(&self) -> bool {
            self.1
        }

        async fn execute(&self, _ctx: &RunContext) -> Result<EngineOutcome, EngineError> {
            Ok(EngineOutcome::Completed {
                summary: json!({"engine": self.0}),
            })
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_tag() {
        let registry = EngineRegistry::new()
            .with(Arc::new(Fixed("PM_DUE", true)))
            .with(Arc::new(Fixed("LEASE_RENEWAL", false)));
        assert!(registry.contains(&WorkflowType::from("PM_DUE")));
        assert!(registry.get(&WorkflowType::from("UNKNOWN")).is_none());
        assert_eq!(registry.scheduled_types(), vec![WorkflowType::from("PM_DUE")]);
        assert_eq!(registry.workflow_types().len(), 2);

        let engine = registry.get(&WorkflowType::from("LEASE_RENEWAL")).unwrap();
        let ctx = RunContext {
            run_id: "run-1".into(),
            workflow_type: WorkflowType::from("LEASE_RENEWAL"),
            manager_id: "mgr-1".into(),
            property_id: None,
            payload: json!({}),
            attempt: 1,
            trigger_type: TriggerType::Manual,
            trigger_ref: None,
        };
        let outcome = engine.execute(&ctx).await.unwrap();
        assert_eq!(
            outcome,
            EngineOutcome::Completed {
                summary: json!({"engine": "LEASE_RENEWAL"})
            }
        );
    }
}
