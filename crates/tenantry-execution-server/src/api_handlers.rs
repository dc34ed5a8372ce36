//! Axum handlers for the control plane HTTP surface.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use tenantry_execution_runtime::runtime::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use tenantry_execution_runtime::{
    BlockReason, ManualTriggerRequest, OpsRuntime, RateLimitDecision, TriggerOutcome,
};
use tenantry_governor::{DryRunRequest, GovernorPatch};
use tenantry_kernel::{
    ActionQuery, ActionStatus, CallerIdentity, ExceptionQuery, ExceptionStatus, KernelError,
    OperatorSettings, PolicyScope, RunOrder, RunQuery, RunStatus, ScopeType, Severity,
};

use crate::api_errors::ApiError;
use crate::api_models::{
    ApiEnvelope, ApiMeta, BlockedResponse, CancelRunRequest, CreatePolicyRequest, LimitQuery,
    ListRunsQuery, PutSettingsRequest, RejectActionRequest, ReplayRunRequest,
    ResolveExceptionRequest, RunListResponse, SchedulerTickRequest, ScopeQuery, SettingsQuery,
    StatusQuery, TriggerResponse, WorkerTickQuery,
};
use crate::auth::{caller_identity, verify_shared_secret};
use crate::config::ServerConfig;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct ControlPlaneState {
    pub runtime: Arc<OpsRuntime>,
    pub cron_secret: Option<Arc<str>>,
    pub stream_max: Duration,
    pub stream_poll: Duration,
}

impl ControlPlaneState {
    pub fn new(runtime: Arc<OpsRuntime>, config: &ServerConfig) -> Self {
        Self {
            runtime,
            cron_secret: config.cron_secret.as_deref().map(Arc::from),
            stream_max: config.stream_max,
            stream_poll: config.stream_poll,
        }
    }
}

pub fn build_router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/trigger", post(trigger_run))
        .route("/v1/runs/stream", get(stream_runs))
        .route("/v1/runs/dead-letter", get(dead_letter))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/runs/:run_id/replay", post(replay_run))
        .route("/v1/scheduler/tick", post(scheduler_tick))
        .route("/v1/worker/tick", post(worker_tick))
        .route("/v1/governor", get(governor_state).patch(patch_governor))
        .route("/v1/policies", get(policy_history).post(create_policy))
        .route("/v1/policies/active", get(active_policy))
        .route("/v1/policies/dry-run", post(dry_run_policy))
        .route("/v1/actions", get(list_actions))
        .route("/v1/actions/:action_id/approve", post(approve_action))
        .route("/v1/actions/:action_id/reject", post(reject_action))
        .route("/v1/actions/:action_id/execute", post(execute_action))
        .route("/v1/exceptions", get(list_exceptions))
        .route("/v1/exceptions/:exception_id/ack", post(acknowledge_exception))
        .route("/v1/exceptions/:exception_id/resolve", post(resolve_exception))
        .route("/v1/settings", get(get_settings).put(put_settings))
        .layer(from_fn(request_log_middleware))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Pins one request id per request so handler logs, error bodies and the
/// response header agree.
async fn request_log_middleware(mut request: axum::extract::Request, next: Next) -> Response {
    let rid = request_id(request.headers());
    let header_value = HeaderValue::from_str(&rid).ok();
    if let Some(value) = &header_value {
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, value.clone());
    }
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;
    tracing::info!(
        request_id = %rid,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http_request"
    );
    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn envelope<T: Serialize>(request_id: String, data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        meta: ApiMeta::ok(),
        request_id,
        data,
    })
}

fn caller(headers: &HeaderMap, rid: &str) -> Result<CallerIdentity, ApiError> {
    caller_identity(headers).map_err(|e| ApiError::from_kernel(e, rid))
}

fn require_secret(
    state: &ControlPlaneState,
    headers: &HeaderMap,
    rid: &str,
) -> Result<(), ApiError> {
    verify_shared_secret(
        headers,
        state.cron_secret.as_deref(),
        state.runtime.config().deployment,
    )
    .map_err(|e| ApiError::from_kernel(e, rid))
}

fn rate_limit_headers(decision: &RateLimitDecision) -> [(HeaderName, HeaderValue); 3] {
    [
        (
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(decision.limit),
        ),
        (
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(decision.remaining),
        ),
        (
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(decision.reset_at.timestamp()),
        ),
    ]
}

/// 423 for governor blocks, 429 for rate limits.
fn blocked_response(
    request_id: String,
    reason: BlockReason,
    rate_limit: Option<RateLimitDecision>,
) -> Response {
    let (status, message) = match &reason {
        BlockReason::Governor(why) => (StatusCode::LOCKED, why.clone()),
        BlockReason::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded".to_string(),
        ),
    };
    tracing::info!(
        request_id = %request_id,
        status = status.as_u16(),
        reason = %message,
        "request_blocked"
    );
    let body = Json(BlockedResponse {
        request_id,
        status: "blocked",
        reason,
        message,
        rate_limit,
    });
    match rate_limit {
        Some(decision) => (status, rate_limit_headers(&decision), body).into_response(),
        None => (status, body).into_response(),
    }
}

fn list_limit(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_LIST_LIMIT,
        Some(n) => n.min(MAX_LIST_LIMIT),
    }
}

fn parse_csv<T>(
    raw: Option<&str>,
    parse: impl Fn(&str) -> Result<T, KernelError>,
) -> Result<Vec<T>, KernelError> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(&parse)
            .collect()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

fn run_query(query: &ListRunsQuery) -> Result<RunQuery, KernelError> {
    Ok(RunQuery {
        manager_id: query.manager_id.clone(),
        statuses: parse_csv(query.status.as_deref(), RunStatus::parse)?,
        order: RunOrder::NewestFirst,
        limit: list_limit(query.limit),
        ..RunQuery::default()
    })
}

fn policy_scope(query: &ScopeQuery) -> Result<PolicyScope, KernelError> {
    let scope_type = match query.scope_type.as_deref() {
        Some(raw) => ScopeType::parse(raw)?,
        None => ScopeType::Global,
    };
    Ok(PolicyScope {
        scope_type,
        scope_id: query.scope_id.clone(),
    })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

pub async fn trigger_run(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(req): Json<ManualTriggerRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let outcome = state
        .runtime
        .manual_trigger(&caller, req)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(match outcome {
        TriggerOutcome::Queued { run, rate_limit } => (
            StatusCode::CREATED,
            rate_limit_headers(&rate_limit),
            envelope(
                rid,
                TriggerResponse {
                    status: "queued",
                    run,
                },
            ),
        )
            .into_response(),
        TriggerOutcome::Blocked { reason, rate_limit } => {
            blocked_response(rid, reason, rate_limit)
        }
    })
}

pub async fn list_runs(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let decision = state.runtime.listing_rate(&caller).await;
    if !decision.allowed {
        return Ok(blocked_response(
            rid,
            BlockReason::RateLimited,
            Some(decision),
        ));
    }
    let query = run_query(&query).map_err(|e| ApiError::from_kernel(e, &rid))?;
    let runs = state
        .runtime
        .list_runs(&caller, query)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok((
        rate_limit_headers(&decision),
        envelope(rid, RunListResponse { runs }),
    )
        .into_response())
}

/// Emits a `runs` snapshot every poll interval and an `end` event once the
/// configured maximum duration has passed; the client reconnects.
pub async fn stream_runs(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let query = run_query(&query).map_err(|e| ApiError::from_kernel(e, &rid))?;
    let runtime = Arc::clone(&state.runtime);
    let (max, poll) = (state.stream_max, state.stream_poll);
    tracing::info!(
        request_id = %rid,
        caller = %caller.id,
        max_secs = max.as_secs(),
        "run_stream_opened"
    );

    let stream = async_stream::stream! {
        let deadline = Instant::now() + max;
        loop {
            match runtime.list_runs(&caller, query.clone()).await {
                Ok(runs) => match Event::default().event("runs").json_data(&runs) {
                    Ok(event) => yield Ok::<Event, Infallible>(event),
                    Err(err) => {
                        tracing::warn!(request_id = %rid, error = %err, "run_stream_encode_failed");
                        break;
                    }
                },
                Err(err) => {
                    tracing::warn!(request_id = %rid, error = %err, "run_stream_query_failed");
                    yield Ok(Event::default().event("error").data(err.to_string()));
                    break;
                }
            }
            if Instant::now() + poll > deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        tracing::debug!(request_id = %rid, "run_stream_closed");
        yield Ok(Event::default().event("end").data("max duration reached"));
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn dead_letter(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<RunListResponse>>, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let runs = state
        .runtime
        .dead_letter(&caller, query.limit.unwrap_or(0))
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, RunListResponse { runs }))
}

pub async fn get_run(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let run = state
        .runtime
        .get_run(&caller, &run_id)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, run))
}

pub async fn cancel_run(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Json(req): Json<CancelRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let run = state
        .runtime
        .cancel_run(&caller, &run_id, req.reason.as_deref())
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, run))
}

pub async fn replay_run(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Json(req): Json<ReplayRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let run = state
        .runtime
        .replay_run(&caller, &run_id, req.mode)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, run))
}

/// Cron entry point. A governor block is reported in the body, not as an
/// error status.
pub async fn scheduler_tick(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(req): Json<SchedulerTickRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    require_secret(&state, &headers, &rid)?;
    let report = state
        .runtime
        .scheduled_tick(&req.targets)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, report))
}

pub async fn worker_tick(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<WorkerTickQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    require_secret(&state, &headers, &rid)?;
    let report = state
        .runtime
        .worker_tick(query.batch_size)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, report))
}

pub async fn governor_state(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let governor = state
        .runtime
        .governor_state(&caller)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, governor))
}

pub async fn patch_governor(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(patch): Json<GovernorPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let governor = state
        .runtime
        .patch_governor(&caller, &patch)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, governor))
}

pub async fn policy_history(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    caller(&headers, &rid)?;
    let scope = policy_scope(&query).map_err(|e| ApiError::from_kernel(e, &rid))?;
    let history = state
        .runtime
        .policy()
        .history(&scope)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, history))
}

pub async fn active_policy(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    caller(&headers, &rid)?;
    let scope = policy_scope(&query).map_err(|e| ApiError::from_kernel(e, &rid))?;
    let active = state
        .runtime
        .policy()
        .active(&scope)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, active))
}

pub async fn create_policy(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(req): Json<CreatePolicyRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let scope = policy_scope(&ScopeQuery {
        scope_type: Some(req.scope_type),
        scope_id: req.scope_id,
    })
    .map_err(|e| ApiError::from_kernel(e, &rid))?;
    let record = state
        .runtime
        .policy()
        .create_policy(&caller, scope, req.config)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok((StatusCode::CREATED, envelope(rid, record)).into_response())
}

pub async fn dry_run_policy(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(req): Json<DryRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    caller(&headers, &rid)?;
    let result = state
        .runtime
        .policy()
        .dry_run(&req)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, result))
}

pub async fn list_actions(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let statuses = parse_csv(query.status.as_deref(), ActionStatus::parse)
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    let actions = state
        .runtime
        .actions()
        .list(
            &caller,
            ActionQuery {
                statuses,
                limit: list_limit(query.limit),
                ..ActionQuery::default()
            },
        )
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, actions))
}

pub async fn approve_action(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(action_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let action = state
        .runtime
        .actions()
        .approve(&caller, &action_id)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, action))
}

pub async fn reject_action(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(action_id): Path<String>,
    Json(req): Json<RejectActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let action = state
        .runtime
        .actions()
        .reject(&caller, &action_id, req.reason)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, action))
}

/// Retries an APPROVED action whose execution was interrupted.
pub async fn execute_action(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(action_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let action = state
        .runtime
        .actions()
        .retry_execution(&caller, &action_id)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, action))
}

pub async fn list_exceptions(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let statuses = parse_csv(query.status.as_deref(), ExceptionStatus::parse)
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    let min_severity = query
        .min_severity
        .as_deref()
        .map(Severity::parse)
        .transpose()
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    let exceptions = state
        .runtime
        .exceptions()
        .list(
            &caller,
            ExceptionQuery {
                statuses,
                min_severity,
                limit: list_limit(query.limit),
                ..ExceptionQuery::default()
            },
        )
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, exceptions))
}

pub async fn acknowledge_exception(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(exception_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let exception = state
        .runtime
        .exceptions()
        .acknowledge(&caller, &exception_id)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, exception))
}

pub async fn resolve_exception(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Path(exception_id): Path<String>,
    Json(req): Json<ResolveExceptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let exception = state
        .runtime
        .exceptions()
        .resolve(&caller, &exception_id, req.note)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, exception))
}

pub async fn get_settings(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Query(query): Query<SettingsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let manager_id = query.manager_id.unwrap_or_else(|| caller.id.clone());
    let settings = state
        .runtime
        .operator_settings(&caller, &manager_id)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, settings))
}

pub async fn put_settings(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
    Json(req): Json<PutSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = request_id(&headers);
    let caller = caller(&headers, &rid)?;
    let settings = OperatorSettings {
        manager_id: req.manager_id.unwrap_or_else(|| caller.id.clone()),
        autonomy_enabled: req.autonomy_enabled,
        auto_execute_action_types: req.auto_execute_action_types,
        updated_at: None,
    };
    let saved = state
        .runtime
        .put_operator_settings(&caller, settings)
        .await
        .map_err(|e| ApiError::from_kernel(e, &rid))?;
    Ok(envelope(rid, saved))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use tenantry_execution_runtime::{
        ActionExecutor, ActionProposal, EngineError, EngineOutcome, EngineRegistry,
        ExecutorRegistry, InMemoryCoordinator, LockManager, OpsRuntime, RateLimitRule,
        RecordOrigin, RunContext, RuntimeConfig, WorkflowEngine,
    };
    use tenantry_governor::PolicyContext;
    use tenantry_kernel::{ActionRecord, InMemoryRepository, KernelError, WorkflowType};

    use super::{build_router, ControlPlaneState};
    use crate::config::ServerConfig;

    struct Echo {
        workflow: &'static str,
        scheduled: bool,
    }

    #[async_trait]
    impl WorkflowEngine for Echo {
        fn workflow_type(&self) -> WorkflowType {
            WorkflowType::from(self.workflow)
        }

        fn scheduled(&self) -> bool {
            self.scheduled
        }

        async fn execute(&self, ctx: &RunContext) -> Result<EngineOutcome, EngineError> {
            Ok(EngineOutcome::Completed {
                summary: json!({ "echo": ctx.payload.clone() }),
            })
        }
    }

    struct Notice;

    #[async_trait]
    impl ActionExecutor for Notice {
        fn action_type(&self) -> &str {
            "send_notice"
        }

        async fn execute(&self, action: &ActionRecord) -> Result<Value, KernelError> {
            Ok(json!({ "sent_to": action.entity_id }))
        }
    }

    fn router_with(runtime: RuntimeConfig) -> Router {
        app(runtime).1
    }

    fn app(runtime: RuntimeConfig) -> (Arc<OpsRuntime>, Router) {
        let config = ServerConfig {
            cron_secret: Some("s3cret".to_string()),
            stream_max: Duration::ZERO,
            stream_poll: Duration::from_millis(10),
            runtime: runtime.clone(),
            ..ServerConfig::default()
        };
        let ops = OpsRuntime::builder(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryCoordinator::new()),
        )
        .config(runtime)
        .engines(
            EngineRegistry::new()
                .with(Arc::new(Echo {
                    workflow: "PM_DUE",
                    scheduled: false,
                }))
                .with(Arc::new(Echo {
                    workflow: "LEASE_REVIEW",
                    scheduled: true,
                })),
        )
        .executors(ExecutorRegistry::new().with(Arc::new(Notice)))
        .build();
        let ops = Arc::new(ops);
        let router = build_router(ControlPlaneState::new(ops.clone(), &config));
        (ops, router)
    }

    fn router() -> Router {
        router_with(RuntimeConfig::default())
    }

    fn request(
        method: Method,
        uri: &str,
        caller: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = caller {
            builder = builder.header("x-caller-id", id).header("x-caller-role", role);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn trigger_body() -> Value {
        json!({"workflow_type": "PM_DUE", "property_id": "P1", "payload": {"schedule": "S1"}})
    }

    const MANAGER: Option<(&str, &str)> = Some(("mgr-1", "manager"));
    const OTHER: Option<(&str, &str)> = Some(("mgr-2", "manager"));
    const ADMIN: Option<(&str, &str)> = Some(("ops", "admin"));

    #[tokio::test]
    async fn healthz_needs_no_identity() {
        let resp = router()
            .oneshot(request(Method::GET, "/healthz", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn missing_caller_is_unauthorized_with_envelope() {
        let req = request(Method::POST, "/v1/runs/trigger", None, Some(trigger_body()));
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "unauthorized");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn trigger_then_read_is_masked_for_other_managers() {
        let router = router();
        let resp = router
            .clone()
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "10");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "9");
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "queued");
        let run_id = body["data"]["run"]["id"].as_str().unwrap().to_string();
        let uri = format!("/v1/runs/{}", run_id);

        let own = router
            .clone()
            .oneshot(request(Method::GET, &uri, MANAGER, None))
            .await
            .unwrap();
        assert_eq!(own.status(), StatusCode::OK);

        let other = router
            .clone()
            .oneshot(request(Method::GET, &uri, OTHER, None))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::NOT_FOUND);

        let admin = router
            .oneshot(request(Method::GET, &uri, ADMIN, None))
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_workflow_is_invalid_argument() {
        let body = json!({"workflow_type": "NOPE"});
        let resp = router()
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn manual_trigger_rate_limit_returns_429() {
        let router = router_with(RuntimeConfig {
            manual_trigger: RateLimitRule::new(1, 60_000),
            ..RuntimeConfig::default()
        });
        let first = router
            .clone()
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = router
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
        let body = body_json(second).await;
        assert_eq!(body["status"], "blocked");
        assert_eq!(body["reason"]["kind"], "rate_limited");
    }

    #[tokio::test]
    async fn kill_switch_blocks_trigger_with_423() {
        let router = router();
        let patch = request(
            Method::PATCH,
            "/v1/governor",
            MANAGER,
            Some(json!({"kill_switch": true, "reason": "vendor outage"})),
        );
        assert_eq!(
            router.clone().oneshot(patch).await.unwrap().status(),
            StatusCode::FORBIDDEN
        );

        let patch = request(
            Method::PATCH,
            "/v1/governor",
            ADMIN,
            Some(json!({"kill_switch": true, "reason": "vendor outage"})),
        );
        let resp = router.clone().oneshot(patch).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["kill_switch"], true);

        let resp = router
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::LOCKED);
        let body = body_json(resp).await;
        assert_eq!(body["reason"]["kind"], "governor");
    }

    #[tokio::test]
    async fn worker_tick_requires_shared_secret() {
        let router = router();
        router
            .clone()
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();

        let denied = router
            .clone()
            .oneshot(request(Method::POST, "/v1/worker/tick", None, None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/worker/tick?batch_size=5")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["picked"], 1);
        assert_eq!(body["data"]["completed"], 1);

        let list = router
            .oneshot(request(Method::GET, "/v1/runs?status=COMPLETED", MANAGER, None))
            .await
            .unwrap();
        assert_eq!(list.status(), StatusCode::OK);
        let body = body_json(list).await;
        assert_eq!(body["data"]["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scheduler_tick_enqueues_once_per_day() {
        let router = router();
        let tick = || {
            Request::builder()
                .method(Method::POST)
                .uri("/v1/scheduler/tick")
                .header("x-cron-secret", "s3cret")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"targets": [{"manager_id": "mgr-1", "property_id": "P1"}]}).to_string(),
                ))
                .unwrap()
        };
        let resp = router.clone().oneshot(tick()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["blocked"], false);
        assert_eq!(body["data"]["enqueued"], 1);

        let body = body_json(router.oneshot(tick()).await.unwrap()).await;
        assert_eq!(body["data"]["enqueued"], 0);
        assert_eq!(body["data"]["duplicates"], 1);
    }

    #[tokio::test]
    async fn dead_letter_and_governor_reads_are_admin_only() {
        let router = router();
        for uri in ["/v1/runs/dead-letter", "/v1/governor"] {
            let resp = router
                .clone()
                .oneshot(request(Method::GET, uri, MANAGER, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{}", uri);
            let resp = router
                .clone()
                .oneshot(request(Method::GET, uri, ADMIN, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{}", uri);
        }
    }

    #[tokio::test]
    async fn run_stream_emits_snapshot_then_closes() {
        let router = router();
        router
            .clone()
            .oneshot(request(Method::POST, "/v1/runs/trigger", MANAGER, Some(trigger_body())))
            .await
            .unwrap();

        let resp = router
            .oneshot(request(Method::GET, "/v1/runs/stream", MANAGER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: runs"));
        assert!(text.contains("PM_DUE"));
        assert!(text.contains("event: end"));
    }

    #[tokio::test]
    async fn policies_are_created_by_admins_and_previewed_by_anyone() {
        let router = router();
        let create = json!({
            "scope_type": "global",
            "config": {"create_work_order": {"autoExecute": true, "maxAmount": 500}}
        });
        let resp = router
            .clone()
            .oneshot(request(Method::POST, "/v1/policies", MANAGER, Some(create.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = router
            .clone()
            .oneshot(request(Method::POST, "/v1/policies", ADMIN, Some(create)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["data"]["version"], 1);

        let resp = router
            .clone()
            .oneshot(request(Method::GET, "/v1/policies/active", MANAGER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["version"], 1);

        let preview = json!({"action_type": "create_work_order", "context": {"amount": 900.0}});
        let resp = router
            .oneshot(request(Method::POST, "/v1/policies/dry-run", MANAGER, Some(preview)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let decision = &body_json(resp).await["data"]["decision"];
        assert_eq!(decision["allowed"], true);
        assert_eq!(decision["requires_approval"], true);
    }

    #[tokio::test]
    async fn settings_are_scoped_to_the_caller() {
        let router = router();
        let resp = router
            .clone()
            .oneshot(request(
                Method::PUT,
                "/v1/settings",
                MANAGER,
                Some(json!({"autonomy_enabled": true})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .clone()
            .oneshot(request(Method::GET, "/v1/settings", MANAGER, None))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["data"]["autonomy_enabled"], true);

        let resp = router
            .oneshot(request(Method::GET, "/v1/settings?manager_id=mgr-1", OTHER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn approved_action_can_be_executed_again_after_lock_contention() {
        let (ops, router) = app(RuntimeConfig::default());
        let action = ops
            .actions()
            .propose(
                RecordOrigin {
                    manager_id: "mgr-1".into(),
                    property_id: Some("P1".into()),
                    run_id: None,
                },
                ActionProposal {
                    action_type: "send_notice".into(),
                    payload: json!({}),
                    entity_type: Some("tenant".into()),
                    entity_id: Some("t-9".into()),
                    policy_context: PolicyContext::default(),
                },
            )
            .await
            .unwrap();
        let held = ops
            .locks()
            .acquire(&LockManager::action_subject(&action.id))
            .await
            .unwrap();

        let approve = format!("/v1/actions/{}/approve", action.id);
        let resp = router
            .clone()
            .oneshot(request(Method::POST, &approve, MANAGER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let execute = format!("/v1/actions/{}/execute", action.id);
        let resp = router
            .clone()
            .oneshot(request(Method::POST, &execute, MANAGER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        ops.locks().release(held).await;

        let resp = router
            .clone()
            .oneshot(request(Method::POST, &execute, OTHER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(request(Method::POST, &execute, MANAGER, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "EXECUTED");
        assert_eq!(body["data"]["result"]["sent_to"], "t-9");
    }
}
