//! API DTOs for the control plane server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tenantry_execution_runtime::{BlockReason, RateLimitDecision, ReplayMode, ScheduleTarget};
use tenantry_kernel::{ManagerId, Run};

#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub meta: ApiMeta,
    pub request_id: String,
    pub data: T,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiMeta {
    pub status: &'static str,
    pub api_version: &'static str,
}

impl ApiMeta {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            api_version: "v1",
        }
    }
}

/// Body of 423/429 responses.
#[derive(Clone, Debug, Serialize)]
pub struct BlockedResponse {
    pub request_id: String,
    pub status: &'static str,
    pub reason: BlockReason,
    pub message: String,
    pub rate_limit: Option<RateLimitDecision>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    pub run: Run,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunListResponse {
    pub runs: Vec<Run>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// Comma-separated run statuses.
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// Admin-only filter; ignored for managers.
    pub manager_id: Option<ManagerId>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReplayRunRequest {
    #[serde(default)]
    pub mode: ReplayMode,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchedulerTickRequest {
    #[serde(default)]
    pub targets: Vec<ScheduleTarget>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WorkerTickQuery {
    pub batch_size: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub scope_type: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub config: Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Comma-separated statuses.
    pub status: Option<String>,
    pub min_severity: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RejectActionRequest {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResolveExceptionRequest {
    pub note: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsQuery {
    pub manager_id: Option<ManagerId>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PutSettingsRequest {
    /// Defaults to the caller.
    #[serde(default)]
    pub manager_id: Option<ManagerId>,
    pub autonomy_enabled: bool,
    #[serde(default)]
    pub auto_execute_action_types: Vec<String>,
}
