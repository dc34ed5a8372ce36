//! Manual and scheduled run creation.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tenantry_governor::SafetyGovernor;
use tenantry_kernel::{
    CallerIdentity, KernelError, ManagerId, OpsRepository, PropertyId, Run, SharedClock,
    TriggerType, WorkflowType,
};

use crate::engine::EngineRegistry;
use crate::rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter, MANUAL_TRIGGER_BUCKET};
use crate::replay::{ConsumeOutcome, ReplayCache};

pub const SCHEDULE_NAMESPACE: &str = "schedule";
/// A day bucket plus slack for late ticks.
pub const DEFAULT_SCHEDULE_DEDUP_TTL_SECS: i64 = 26 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualTriggerRequest {
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub property_id: Option<PropertyId>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    Governor(String),
    RateLimited,
}

/// Result of a manual trigger. A block is an expected outcome, not an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Queued {
        run: Run,
        rate_limit: RateLimitDecision,
    },
    Blocked {
        reason: BlockReason,
        rate_limit: Option<RateLimitDecision>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTarget {
    pub manager_id: ManagerId,
    pub property_id: PropertyId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTickReport {
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub enqueued: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct TriggerService {
    repo: Arc<dyn OpsRepository>,
    governor: Arc<SafetyGovernor>,
    limiter: Arc<RateLimiter>,
    replay: Arc<ReplayCache>,
    engines: EngineRegistry,
    clock: SharedClock,
    manual_rule: RateLimitRule,
    schedule_dedup_ttl: Duration,
    allow_local_fallback: bool,
}

impl TriggerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn OpsRepository>,
        governor: Arc<SafetyGovernor>,
        limiter: Arc<RateLimiter>,
        replay: Arc<ReplayCache>,
        engines: EngineRegistry,
        clock: SharedClock,
        manual_rule: RateLimitRule,
        allow_local_fallback: bool,
    ) -> Self {
        Self {
            repo,
            governor,
            limiter,
            replay,
            engines,
            clock,
            manual_rule,
            schedule_dedup_ttl: Duration::seconds(DEFAULT_SCHEDULE_DEDUP_TTL_SECS),
            allow_local_fallback,
        }
    }

    pub fn with_schedule_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.schedule_dedup_ttl = ttl;
        self
    }

    /// One PENDING run per call, owned by the calling manager.
    pub async fn manual_trigger(
        &self,
        caller: &CallerIdentity,
        request: ManualTriggerRequest,
    ) -> Result<TriggerOutcome, KernelError> {
        if !self.engines.contains(&request.workflow_type) {
            return Err(KernelError::Validation(format!(
                "unknown workflow type '{}'",
                request.workflow_type
            )));
        }

        let rate = self
            .limiter
            .check_rule(MANUAL_TRIGGER_BUCKET, &caller.id, self.manual_rule)
            .await;
        if !rate.allowed {
            return Ok(TriggerOutcome::Blocked {
                reason: BlockReason::RateLimited,
                rate_limit: Some(rate),
            });
        }

        if let Some(reason) = self.governor.block_reason().await? {
            tracing::info!(manager_id = %caller.id, reason = %reason, "manual_trigger_blocked");
            return Ok(TriggerOutcome::Blocked {
                reason: BlockReason::Governor(reason),
                rate_limit: Some(rate),
            });
        }

        let mut run = Run::pending(
            request.workflow_type,
            caller.id.clone(),
            TriggerType::Manual,
            self.clock.now(),
        );
        if let Some(property_id) = request.property_id {
            run = run.with_property(property_id);
        }
        if !request.payload.is_null() {
            run = run.with_payload(request.payload);
        }
        self.repo.insert_run(&run).await?;
        tracing::info!(
            run_id = %run.id,
            workflow_type = %run.workflow_type,
            manager_id = %run.manager_id,
            "manual_trigger_queued"
        );
        Ok(TriggerOutcome::Queued {
            run,
            rate_limit: rate,
        })
    }

    /// Enqueues every scheduled workflow for every target at most once per
    /// UTC day.
    pub async fn scheduled_tick(
        &self,
        targets: &[ScheduleTarget],
    ) -> Result<ScheduledTickReport, KernelError> {
        let mut report = ScheduledTickReport::default();
        if let Some(reason) = self.governor.block_reason().await? {
            tracing::info!(reason = %reason, "scheduled_tick_blocked");
            report.blocked = true;
            report.blocked_reason = Some(reason);
            return Ok(report);
        }

        let now = self.clock.now();
        let day = now.format("%Y-%m-%d").to_string();
        for workflow_type in self.engines.scheduled_types() {
            for target in targets {
                let trigger_ref =
                    format!("schedule:{}:{}:{}", workflow_type, target.property_id, day);
                match self
                    .replay
                    .consume(SCHEDULE_NAMESPACE, &trigger_ref, self.schedule_dedup_ttl)
                    .await
                {
                    ConsumeOutcome::Accepted => {}
                    ConsumeOutcome::Duplicate => {
                        report.duplicates += 1;
                        continue;
                    }
                    ConsumeOutcome::Unavailable if self.allow_local_fallback => {}
                    ConsumeOutcome::Unavailable => {
                        report.skipped += 1;
                        continue;
                    }
                }
                let run = Run::pending(
                    workflow_type.clone(),
                    target.manager_id.clone(),
                    TriggerType::Scheduled,
                    now,
                )
                .with_property(target.property_id.clone())
                .with_trigger_ref(trigger_ref);
                match self.repo.insert_run(&run).await {
                    Ok(()) => report.enqueued += 1,
                    Err(KernelError::Conflict(_)) => report.duplicates += 1,
                    Err(err) => {
                        let trigger_ref = run.trigger_ref.as_deref().unwrap_or_default();
                        let released = self.replay.release(SCHEDULE_NAMESPACE, trigger_ref).await;
                        tracing::warn!(
                            trigger_ref,
                            released,
                            error = %err,
                            "scheduled_enqueue_failed"
                        );
                        return Err(err);
                    }
                }
            }
        }
        tracing::info!(
            targets = targets.len(),
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "scheduled_tick"
        );
        Ok(report)
    }
}
