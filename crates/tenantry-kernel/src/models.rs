//! Durable control-plane records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KernelError;
use crate::identity::{
    new_id, ActionId, ExceptionId, ManagerId, PolicyId, PropertyId, RunId, WorkflowType,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Summary key marking a run as dead-lettered.
pub const DLQ_FLAG: &str = "dlq";

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Escalated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Escalated => "ESCALATED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "ESCALATED" => Ok(RunStatus::Escalated),
            other => Err(KernelError::Validation(format!(
                "unknown run status '{}'",
                other
            ))),
        }
    }

    /// ESCALATED is terminal too; only an explicit replay leaves it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Escalated
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "MANUAL",
            TriggerType::Scheduled => "SCHEDULED",
            TriggerType::Event => "EVENT",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "MANUAL" => Ok(TriggerType::Manual),
            "SCHEDULED" => Ok(TriggerType::Scheduled),
            "EVENT" => Ok(TriggerType::Event),
            other => Err(KernelError::Validation(format!(
                "unknown trigger type '{}'",
                other
            ))),
        }
    }
}

/// One queued, executing or terminal workflow execution.
///
/// Invariant: `attempts <= max_attempts`. An ESCALATED run carries
/// `summary.dlq == true`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_type: WorkflowType,
    pub status: RunStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub trigger_type: TriggerType,
    pub trigger_ref: Option<String>,
    pub manager_id: ManagerId,
    pub property_id: Option<PropertyId>,
    pub payload: Value,
    pub error: Option<String>,
    pub summary: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn pending(
        workflow_type: impl Into<WorkflowType>,
        manager_id: impl Into<ManagerId>,
        trigger_type: TriggerType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("run"),
            workflow_type: workflow_type.into(),
            status: RunStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            trigger_type,
            trigger_ref: None,
            manager_id: manager_id.into(),
            property_id: None,
            payload: Value::Object(Map::new()),
            error: None,
            summary: Value::Object(Map::new()),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_property(mut self, property_id: impl Into<PropertyId>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_trigger_ref(mut self, trigger_ref: impl Into<String>) -> Self {
        self.trigger_ref = Some(trigger_ref.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.summary
            .get(DLQ_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Sets one key on the summary object, converting a non-object summary
    /// into an object first.
    pub fn set_summary_field(&mut self, key: &str, value: Value) {
        if !self.summary.is_object() {
            self.summary = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.summary {
            map.insert(key.to_string(), value);
        }
    }

    /// Merges an engine summary into the run summary (engine keys win).
    pub fn merge_summary(&mut self, summary: Value) {
        match summary {
            Value::Object(entries) => {
                for (key, value) in entries {
                    self.set_summary_field(&key, value);
                }
            }
            Value::Null => {}
            other => self.set_summary_field("result", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Filter for run listings.
#[derive(Clone, Debug, Default)]
pub struct RunQuery {
    pub manager_id: Option<ManagerId>,
    pub statuses: Vec<RunStatus>,
    pub started_before: Option<DateTime<Utc>>,
    pub order: RunOrder,
    pub limit: usize,
}

impl RunQuery {
    pub fn pending(limit: usize) -> Self {
        Self {
            statuses: vec![RunStatus::Pending],
            limit,
            ..Self::default()
        }
    }

    pub fn dead_letter(limit: usize) -> Self {
        Self {
            statuses: vec![RunStatus::Escalated],
            order: RunOrder::NewestFirst,
            limit,
            ..Self::default()
        }
    }

    pub fn for_manager(mut self, manager_id: impl Into<ManagerId>) -> Self {
        self.manager_id = Some(manager_id.into());
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        if let Some(manager_id) = &self.manager_id {
            if &run.manager_id != manager_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&run.status) {
            return false;
        }
        if let Some(before) = self.started_before {
            match run.started_at {
                Some(started) if started < before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Run counts over a trailing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub failed: u64,
}

impl RunStats {
    pub fn failure_rate_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.failed as f64 / self.total as f64) * 100.0
    }
}

/// Error text written by a manual cancel; cancellations do not count as
/// failures for the safety governor.
pub const CANCELLED_ERROR: &str = "cancelled";

pub fn is_cancellation(run: &Run) -> bool {
    run.status == RunStatus::Failed
        && run
            .error
            .as_deref()
            .map(|e| e.starts_with(CANCELLED_ERROR))
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(KernelError::Validation(format!(
                "unknown severity '{}'",
                other
            ))),
        }
    }

    /// Default human response window used when no deadline is given.
    pub fn response_window(&self) -> Duration {
        match self {
            Severity::Critical => Duration::hours(4),
            Severity::High => Duration::hours(24),
            Severity::Medium => Duration::hours(72),
            Severity::Low => Duration::days(7),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionStatus {
    Open,
    Ack,
    Resolved,
}

impl ExceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionStatus::Open => "OPEN",
            ExceptionStatus::Ack => "ACK",
            ExceptionStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "OPEN" => Ok(ExceptionStatus::Open),
            "ACK" => Ok(ExceptionStatus::Ack),
            "RESOLVED" => Ok(ExceptionStatus::Resolved),
            other => Err(KernelError::Validation(format!(
                "unknown exception status '{}'",
                other
            ))),
        }
    }
}

/// A human-review item raised when automation cannot safely proceed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: ExceptionId,
    pub run_id: Option<RunId>,
    pub manager_id: ManagerId,
    pub property_id: Option<PropertyId>,
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub details: String,
    pub context: Value,
    pub status: ExceptionStatus,
    pub requires_by: DateTime<Utc>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ExceptionQuery {
    pub manager_id: Option<ManagerId>,
    pub statuses: Vec<ExceptionStatus>,
    pub min_severity: Option<Severity>,
    pub limit: usize,
}

impl ExceptionQuery {
    pub fn matches(&self, record: &ExceptionRecord) -> bool {
        if let Some(manager_id) = &self.manager_id {
            if &record.manager_id != manager_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(min) = self.min_severity {
            if record.severity < min {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    PendingApproval,
    Approved,
    Executed,
    Rejected,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::PendingApproval => "PENDING_APPROVAL",
            ActionStatus::Approved => "APPROVED",
            ActionStatus::Executed => "EXECUTED",
            ActionStatus::Rejected => "REJECTED",
            ActionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "PENDING_APPROVAL" => Ok(ActionStatus::PendingApproval),
            "APPROVED" => Ok(ActionStatus::Approved),
            "EXECUTED" => Ok(ActionStatus::Executed),
            "REJECTED" => Ok(ActionStatus::Rejected),
            "FAILED" => Ok(ActionStatus::Failed),
            other => Err(KernelError::Validation(format!(
                "unknown action status '{}'",
                other
            ))),
        }
    }
}

/// One concrete side-effecting operation proposed by a workflow engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub manager_id: ManagerId,
    pub property_id: Option<PropertyId>,
    pub run_id: Option<RunId>,
    pub action_type: String,
    pub status: ActionStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub decision_reason: Option<String>,
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct ActionQuery {
    pub manager_id: Option<ManagerId>,
    pub statuses: Vec<ActionStatus>,
    pub limit: usize,
}

impl ActionQuery {
    pub fn matches(&self, record: &ActionRecord) -> bool {
        if let Some(manager_id) = &self.manager_id {
            if &record.manager_id != manager_id {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&record.status)
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Property,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Property => "property",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "global" => Ok(ScopeType::Global),
            "property" => Ok(ScopeType::Property),
            other => Err(KernelError::Validation(format!(
                "unknown policy scope type '{}'",
                other
            ))),
        }
    }
}

/// Exact policy scope. A global scope never carries an id; a property scope
/// always does.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyScope {
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
}

impl PolicyScope {
    pub fn global() -> Self {
        Self {
            scope_type: ScopeType::Global,
            scope_id: None,
        }
    }

    pub fn property(property_id: impl Into<PropertyId>) -> Self {
        Self {
            scope_type: ScopeType::Property,
            scope_id: Some(property_id.into()),
        }
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        match (self.scope_type, self.scope_id.as_deref()) {
            (ScopeType::Global, None) => Ok(()),
            (ScopeType::Global, Some(_)) => Err(KernelError::Validation(
                "global policy scope must not carry a scope_id".into(),
            )),
            (ScopeType::Property, Some(id)) if !id.trim().is_empty() => Ok(()),
            (ScopeType::Property, _) => Err(KernelError::Validation(
                "property policy scope requires a scope_id".into(),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub scope: PolicyScope,
    pub config: Value,
    pub version: u32,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a new policy version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewPolicy {
    pub scope: PolicyScope,
    pub config: Value,
    pub created_by: String,
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Process-wide autonomy circuit breaker, persisted as a single row and
/// updated only by compare-and-swap on `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernorState {
    pub kill_switch: bool,
    pub reason: Option<String>,
    pub auto_pause_until: Option<DateTime<Utc>>,
    pub auto_pause_reason: Option<String>,
    pub failure_threshold_pct: u8,
    pub critical_open_threshold: u32,
    pub window_hours: u32,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl Default for GovernorState {
    fn default() -> Self {
        Self {
            kill_switch: false,
            reason: None,
            auto_pause_until: None,
            auto_pause_reason: None,
            failure_threshold_pct: 30,
            critical_open_threshold: 3,
            window_hours: 24,
            version: 0,
            updated_at: None,
            updated_by: None,
        }
    }
}

impl GovernorState {
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.kill_switch || self.is_auto_paused(now)
    }

    pub fn is_auto_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(self.auto_pause_until, Some(until) if now < until)
    }

    /// Human-readable reason for the current block, if any.
    pub fn block_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.kill_switch {
            return Some(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "kill switch engaged".to_string()),
            );
        }
        if self.is_auto_paused(now) {
            return Some(
                self.auto_pause_reason
                    .clone()
                    .unwrap_or_else(|| "autonomy auto-paused".to_string()),
            );
        }
        None
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if !(1..=100).contains(&self.failure_threshold_pct) {
            return Err(KernelError::Validation(format!(
                "failure_threshold_pct must be within 1..=100, got {}",
                self.failure_threshold_pct
            )));
        }
        if self.critical_open_threshold < 1 {
            return Err(KernelError::Validation(
                "critical_open_threshold must be at least 1".into(),
            ));
        }
        if !(1..=168).contains(&self.window_hours) {
            return Err(KernelError::Validation(format!(
                "window_hours must be within 1..=168, got {}",
                self.window_hours
            )));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.window_hours))
    }
}

// ---------------------------------------------------------------------------
// Operator settings and callers
// ---------------------------------------------------------------------------

/// Per-manager autonomy opt-in. Policy allowance alone never auto-executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorSettings {
    pub manager_id: ManagerId,
    pub autonomy_enabled: bool,
    /// Empty means any action type the policy allows.
    pub auto_execute_action_types: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OperatorSettings {
    pub fn disabled(manager_id: impl Into<ManagerId>) -> Self {
        Self {
            manager_id: manager_id.into(),
            autonomy_enabled: false,
            auto_execute_action_types: Vec::new(),
            updated_at: None,
        }
    }

    pub fn permits(&self, action_type: &str) -> bool {
        self.autonomy_enabled
            && (self.auto_execute_action_types.is_empty()
                || self
                    .auto_execute_action_types
                    .iter()
                    .any(|t| t == action_type))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Admin,
    Manager,
}

/// Verified caller identity supplied by the authentication layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: String,
    pub role: CallerRole,
}

impl CallerIdentity {
    pub fn manager(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Manager,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == CallerRole::Admin
    }

    /// Admins see everything; managers only their own scope.
    pub fn can_access(&self, manager_id: &str) -> bool {
        self.is_admin() || self.id == manager_id
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn pending_run_defaults() {
        let run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, now());
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.attempts, 0);
        assert_eq!(run.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(!run.is_dead_lettered());
        assert!(run.has_attempts_left());
    }

    #[test]
    fn max_attempts_is_never_zero() {
        let run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, now()).with_max_attempts(0);
        assert_eq!(run.max_attempts, 1);
    }

    #[test]
    fn summary_merge_keeps_dlq_flag_and_wraps_scalars() {
        let mut run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, now());
        run.set_summary_field(DLQ_FLAG, json!(true));
        run.merge_summary(json!({"notices": 2}));
        run.merge_summary(json!("done"));
        assert!(run.is_dead_lettered());
        assert_eq!(run.summary["notices"], json!(2));
        assert_eq!(run.summary["result"], json!("done"));
    }

    #[test]
    fn run_query_filters_on_started_before() {
        let mut run = Run::pending("PM_DUE", "mgr-1", TriggerType::Manual, now());
        run.status = RunStatus::Running;
        run.started_at = Some(now());
        let mut query = RunQuery {
            statuses: vec![RunStatus::Running],
            started_before: Some(now() + Duration::minutes(1)),
            ..RunQuery::default()
        };
        assert!(query.matches(&run));
        query.started_before = Some(now());
        assert!(!query.matches(&run));
    }

    #[test]
    fn failure_rate_handles_empty_window() {
        assert_eq!(RunStats::default().failure_rate_pct(), 0.0);
        let stats = RunStats {
            total: 4,
            failed: 1,
        };
        assert_eq!(stats.failure_rate_pct(), 25.0);
    }

    #[test]
    fn governor_blocked_by_kill_switch_or_pause_window() {
        let mut state = GovernorState::default();
        assert!(!state.is_blocked(now()));
        state.auto_pause_until = Some(now() + Duration::hours(1));
        assert!(state.is_blocked(now()));
        assert!(!state.is_blocked(now() + Duration::hours(2)));
        state.kill_switch = true;
        assert!(state.is_blocked(now() + Duration::hours(2)));
        assert_eq!(
            state.block_reason(now()).as_deref(),
            Some("kill switch engaged")
        );
    }

    #[test]
    fn governor_validation_bounds() {
        let mut state = GovernorState::default();
        assert!(state.validate().is_ok());
        state.failure_threshold_pct = 0;
        assert!(state.validate().is_err());
        state.failure_threshold_pct = 100;
        state.window_hours = 169;
        assert!(state.validate().is_err());
        state.window_hours = 168;
        state.critical_open_threshold = 0;
        assert!(state.validate().is_err());
    }

    #[test]
    fn policy_scope_validation() {
        assert!(PolicyScope::global().validate().is_ok());
        assert!(PolicyScope::property("p-1").validate().is_ok());
        assert!(PolicyScope::property(" ").validate().is_err());
        let bad = PolicyScope {
            scope_type: ScopeType::Global,
            scope_id: Some("x".into()),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn operator_settings_permit_only_when_enabled() {
        let mut settings = OperatorSettings::disabled("mgr-1");
        assert!(!settings.permits("SEND_NOTICE"));
        settings.autonomy_enabled = true;
        assert!(settings.permits("SEND_NOTICE"));
        settings.auto_execute_action_types = vec!["CREATE_WORK_ORDER".into()];
        assert!(!settings.permits("SEND_NOTICE"));
        assert!(settings.permits("CREATE_WORK_ORDER"));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Escalated,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ActionStatus::parse("BOGUS").is_err());
        assert_eq!(Severity::parse("critical").unwrap(), Severity::Critical);
    }

    #[test]
    fn caller_access_is_scoped() {
        assert!(CallerIdentity::admin("root").can_access("mgr-9"));
        assert!(CallerIdentity::manager("mgr-1").can_access("mgr-1"));
        assert!(!CallerIdentity::manager("mgr-1").can_access("mgr-2"));
    }
}
