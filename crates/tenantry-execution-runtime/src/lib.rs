//! Execution runtime for the Tenantry autopilot control plane.
//!
//! Coordination primitives ([LockManager], [ReplayCache], [RateLimiter]) sit
//! on a shared [Coordinator]; the run queue is advanced by the [Worker]
//! through [RunLifecycle] compare-and-swap transitions; runs enter the queue
//! through [TriggerService] and [EventPublisher]. [OpsRuntime] wires all of
//! it over one repository.

pub mod actions;
pub mod coordinator;
pub mod engine;
pub mod exceptions;
pub mod lifecycle;
pub mod lock;
#[cfg(feature = "kernel-postgres")]
pub mod postgres_coordinator;
pub mod publisher;
pub mod rate_limit;
pub mod replay;
pub mod runtime;
pub mod triggers;
pub mod worker;

pub use actions::{
    ActionExecutor, ActionService, ExecutorRegistry, AUTOPILOT_DECIDER, POLICY_DECIDER,
};
pub use coordinator::{
    Coordinator, CoordinatorError, FallbackCoordinator, InMemoryCoordinator, KeySpace, Subsystem,
    WindowCount,
};
pub use engine::{
    ActionProposal, EngineError, EngineOutcome, EngineRegistry, ExceptionDraft, RecordOrigin,
    RunContext, WorkflowEngine,
};
pub use exceptions::ExceptionService;
pub use lifecycle::{FailureOutcome, ReplayMode, RunLifecycle, StaleReport};
pub use lock::{LockHandle, LockManager, DEFAULT_LOCK_TTL_SECS};
#[cfg(feature = "kernel-postgres")]
pub use postgres_coordinator::PostgresCoordinator;
pub use publisher::{DomainEvent, EventPublisher, EventRoutes, IngestOutcome};
pub use rate_limit::{
    RateLimitDecision, RateLimitRule, RateLimiter, LIST_BUCKET, MANUAL_TRIGGER_BUCKET,
};
pub use replay::{ConsumeOutcome, ReplayCache};
pub use runtime::{OpsRuntime, OpsRuntimeBuilder, RuntimeConfig};
pub use triggers::{
    BlockReason, ManualTriggerRequest, ScheduleTarget, ScheduledTickReport, TriggerOutcome,
    TriggerService,
};
pub use worker::{clamp_batch_size, Worker, WorkerTickReport, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
