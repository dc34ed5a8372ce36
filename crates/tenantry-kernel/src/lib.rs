//! Tenantry kernel: the records and persistence contracts shared by every
//! part of the autopilot control plane.
//!
//! The relational store is the only system of record. Everything in this
//! crate is either a durable record (Run, Exception, Action, Policy,
//! GovernorState, OperatorSettings) or the [OpsRepository] contract used to
//! read and compare-and-swap those records.

pub mod clock;
pub mod collaborators;
pub mod deployment;
pub mod error;
pub mod identity;
pub mod memory_repository;
pub mod models;
#[cfg(feature = "kernel-postgres")]
pub mod postgres_repository;
pub mod repository;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{Notification, Notifier, NoopNotifier};
pub use deployment::DeploymentMode;
pub use error::KernelError;
pub use identity::{
    new_id, ActionId, ExceptionId, ManagerId, PolicyId, PropertyId, RunId, WorkflowType,
};
pub use memory_repository::InMemoryRepository;
pub use models::{
    is_cancellation, ActionQuery, ActionRecord, ActionStatus, CallerIdentity, CallerRole,
    ExceptionQuery, ExceptionRecord, ExceptionStatus, GovernorState, NewPolicy, OperatorSettings,
    PolicyRecord, PolicyScope, Run, RunOrder, RunQuery, RunStats, RunStatus, ScopeType, Severity,
    TriggerType, CANCELLED_ERROR, DEFAULT_MAX_ATTEMPTS, DLQ_FLAG,
};
#[cfg(feature = "kernel-postgres")]
pub use postgres_repository::PostgresRepository;
pub use repository::OpsRepository;
