//! Governance for autonomous execution: the layered [PolicyEngine] that gates
//! individual actions and the process-wide [SafetyGovernor] circuit breaker.

pub mod policy;
pub mod safety;

pub use policy::{
    merge_configs, DryRunRequest, DryRunResult, EffectivePolicy, PolicyContext, PolicyDecision,
    PolicyEngine, RuleSource,
};
pub use safety::{GovernorEvaluation, GovernorPatch, SafetyGovernor};
