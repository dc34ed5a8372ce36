//! Policy engine: layered (global → property) action rules.
//!
//! A policy config is a flat JSON object keyed by action type. Each value is
//! a rule object:
//!
//! ```json
//! {
//!   "SEND_NOTICE": { "autoExecute": true, "allowedSeverities": ["LOW", "MEDIUM"] },
//!   "CREATE_WORK_ORDER": { "autoExecute": true, "maxAmount": 500, "minConfidence": 0.8 },
//!   "ISSUE_REFUND": { "deny": true }
//! }
//! ```
//!
//! An active property-scope config is shallow-merged over the global one, so
//! a property rule replaces the global rule for the same action type as a
//! whole. An action type with no rule in either layer requires approval.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tenantry_kernel::{
    CallerIdentity, KernelError, NewPolicy, OpsRepository, PolicyRecord, PolicyScope, Severity,
    SharedClock,
};

/// Facts about a proposed action that rule predicates are checked against.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyContext {
    pub amount: Option<f64>,
    pub severity: Option<Severity>,
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub requires_approval: bool,
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_approval: false,
        }
    }

    fn needs_approval(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_approval: true,
        }
    }

    fn autonomous(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_approval: false,
        }
    }

    /// Allowed without a human in the loop.
    pub fn permits_autonomy(&self) -> bool {
        self.allowed && !self.requires_approval
    }
}

/// Which layer supplied the rule that decided an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Property,
    Global,
    Default,
}

/// The merged configuration in force for one property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub config: Value,
    pub global: Option<PolicyRecord>,
    pub property: Option<PolicyRecord>,
}

impl EffectivePolicy {
    pub fn from_layers(global: Option<PolicyRecord>, property: Option<PolicyRecord>) -> Self {
        let config = merge_configs(
            global.as_ref().map(|p| &p.config),
            property.as_ref().map(|p| &p.config),
        );
        Self {
            config,
            global,
            property,
        }
    }

    pub fn rule_source(&self, action_type: &str) -> RuleSource {
        let has = |record: &Option<PolicyRecord>| {
            record
                .as_ref()
                .and_then(|p| p.config.get(action_type))
                .is_some()
        };
        if has(&self.property) {
            RuleSource::Property
        } else if has(&self.global) {
            RuleSource::Global
        } else {
            RuleSource::Default
        }
    }
}

/// Shallow merge: every top-level key of `property` replaces the same key of
/// `global`. Non-object layers contribute nothing.
pub fn merge_configs(global: Option<&Value>, property: Option<&Value>) -> Value {
    let mut merged = Map::new();
    for layer in [global, property].into_iter().flatten() {
        if let Value::Object(entries) = layer {
            for (key, value) in entries {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Pure evaluation of one action type against a merged config.
pub fn evaluate(action_type: &str, context: &PolicyContext, config: &Value) -> PolicyDecision {
    let Some(rule) = config.get(action_type) else {
        return PolicyDecision::needs_approval(format!(
            "no rule for '{}'; human approval required",
            action_type
        ));
    };
    let Value::Object(rule) = rule else {
        return PolicyDecision::needs_approval(format!(
            "rule for '{}' is not an object; human approval required",
            action_type
        ));
    };

    if rule.get("deny").and_then(Value::as_bool).unwrap_or(false) {
        return PolicyDecision::deny(format!("'{}' is denied by policy", action_type));
    }

    if let Some(max) = rule.get("maxAmount").and_then(Value::as_f64) {
        match context.amount {
            Some(amount) if amount <= max => {}
            Some(amount) => {
                return PolicyDecision::needs_approval(format!(
                    "amount {} exceeds autonomous limit {}",
                    amount, max
                ))
            }
            None => {
                return PolicyDecision::needs_approval("amount unknown; limit cannot be checked")
            }
        }
    }

    if let Some(allowed) = rule.get("allowedSeverities").and_then(Value::as_array) {
        let allowed: Vec<Severity> = allowed
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|s| Severity::parse(s).ok())
            .collect();
        match context.severity {
            Some(severity) if allowed.contains(&severity) => {}
            Some(severity) => {
                return PolicyDecision::needs_approval(format!(
                    "severity {} is not cleared for autonomy",
                    severity.as_str()
                ))
            }
            None => {
                return PolicyDecision::needs_approval(
                    "severity unknown; severity gate cannot be checked",
                )
            }
        }
    }

    if let Some(max) = rule
        .get("maxSeverity")
        .and_then(Value::as_str)
        .and_then(|s| Severity::parse(s).ok())
    {
        match context.severity {
            Some(severity) if severity <= max => {}
            Some(severity) => {
                return PolicyDecision::needs_approval(format!(
                    "severity {} is above {}",
                    severity.as_str(),
                    max.as_str()
                ))
            }
            None => {
                return PolicyDecision::needs_approval(
                    "severity unknown; severity gate cannot be checked",
                )
            }
        }
    }

    if let Some(min) = rule.get("minConfidence").and_then(Value::as_f64) {
        match context.confidence {
            Some(confidence) if confidence >= min => {}
            Some(confidence) => {
                return PolicyDecision::needs_approval(format!(
                    "confidence {} is below {}",
                    confidence, min
                ))
            }
            None => {
                return PolicyDecision::needs_approval(
                    "confidence unknown; threshold cannot be checked",
                )
            }
        }
    }

    if rule
        .get("autoExecute")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        PolicyDecision::autonomous(format!("'{}' is cleared for autonomous execution", action_type))
    } else {
        PolicyDecision::needs_approval(format!(
            "'{}' is allowed with human approval",
            action_type
        ))
    }
}

/// Rejects configs the evaluator could only interpret as "needs approval"
/// by accident (misspelt types, wrong shapes).
pub fn validate_config(config: &Value) -> Result<(), KernelError> {
    let Value::Object(rules) = config else {
        return Err(KernelError::Validation(
            "policy config must be a JSON object keyed by action type".into(),
        ));
    };
    for (action_type, rule) in rules {
        let Value::Object(rule) = rule else {
            return Err(KernelError::Validation(format!(
                "rule for '{}' must be an object",
                action_type
            )));
        };
        for (key, value) in rule {
            let ok = match key.as_str() {
                "deny" | "autoExecute" => value.is_boolean(),
                "maxAmount" | "minConfidence" => value.is_number(),
                "maxSeverity" => value.as_str().map(|s| Severity::parse(s).is_ok()) == Some(true),
                "allowedSeverities" => value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .all(|v| v.as_str().map(|s| Severity::parse(s).is_ok()) == Some(true))
                    })
                    .unwrap_or(false),
                _ => {
                    return Err(KernelError::Validation(format!(
                        "unknown rule key '{}' for '{}'",
                        key, action_type
                    )))
                }
            };
            if !ok {
                return Err(KernelError::Validation(format!(
                    "invalid value for '{}.{}'",
                    action_type, key
                )));
            }
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DryRunRequest {
    pub action_type: String,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub context: PolicyContext,
    /// Evaluates a candidate property config instead of the stored one.
    #[serde(default)]
    pub property_config: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub decision: PolicyDecision,
    pub rule_source: RuleSource,
    pub effective_config: Value,
    pub global_version: Option<u32>,
    pub property_version: Option<u32>,
}

/// Repository-backed policy operations.
pub struct PolicyEngine {
    repo: Arc<dyn OpsRepository>,
    clock: SharedClock,
}

impl PolicyEngine {
    pub fn new(repo: Arc<dyn OpsRepository>, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    pub async fn effective_policy(
        &self,
        property_id: Option<&str>,
    ) -> Result<EffectivePolicy, KernelError> {
        let global = self.repo.active_policy(&PolicyScope::global()).await?;
        let property = match property_id {
            Some(id) => self.repo.active_policy(&PolicyScope::property(id)).await?,
            None => None,
        };
        Ok(EffectivePolicy::from_layers(global, property))
    }

    pub async fn evaluate(
        &self,
        property_id: Option<&str>,
        action_type: &str,
        context: &PolicyContext,
    ) -> Result<PolicyDecision, KernelError> {
        let effective = self.effective_policy(property_id).await?;
        let decision = evaluate(action_type, context, &effective.config);
        tracing::debug!(
            action_type,
            property_id = property_id.unwrap_or("-"),
            allowed = decision.allowed,
            requires_approval = decision.requires_approval,
            "policy_evaluated"
        );
        Ok(decision)
    }

    /// Previews a hypothetical action without writing anything.
    pub async fn dry_run(&self, request: &DryRunRequest) -> Result<DryRunResult, KernelError> {
        let mut effective = self.effective_policy(request.property_id.as_deref()).await?;
        if let Some(candidate) = &request.property_config {
            validate_config(candidate)?;
            let global_config = effective.global.as_ref().map(|p| p.config.clone());
            effective.config = merge_configs(global_config.as_ref(), Some(candidate));
            effective.property = Some(PolicyRecord {
                id: "dry-run".to_string(),
                scope: PolicyScope::property(request.property_id.clone().unwrap_or_default()),
                config: candidate.clone(),
                version: effective.property.as_ref().map(|p| p.version + 1).unwrap_or(1),
                is_active: false,
                created_by: "dry-run".to_string(),
                created_at: self.clock.now(),
            });
        }
        let decision = evaluate(&request.action_type, &request.context, &effective.config);
        Ok(DryRunResult {
            rule_source: effective.rule_source(&request.action_type),
            global_version: effective.global.as_ref().map(|p| p.version),
            property_version: effective.property.as_ref().map(|p| p.version),
            effective_config: effective.config,
            decision,
        })
    }

    /// Creates the next active version for a scope. Administrators only.
    pub async fn create_policy(
        &self,
        caller: &CallerIdentity,
        scope: PolicyScope,
        config: Value,
    ) -> Result<PolicyRecord, KernelError> {
        if !caller.is_admin() {
            return Err(KernelError::Forbidden(
                "only administrators may change policies".into(),
            ));
        }
        scope.validate()?;
        validate_config(&config)?;
        let draft = NewPolicy {
            scope,
            config,
            created_by: caller.id.clone(),
        };
        let record = self.repo.create_policy(&draft, self.clock.now()).await?;
        tracing::info!(
            policy_id = %record.id,
            scope_type = record.scope.scope_type.as_str(),
            scope_id = record.scope.scope_id.as_deref().unwrap_or("-"),
            version = record.version,
            created_by = %record.created_by,
            "policy_created"
        );
        Ok(record)
    }

    pub async fn active(&self, scope: &PolicyScope) -> Result<Option<PolicyRecord>, KernelError> {
        scope.validate()?;
        self.repo.active_policy(scope).await
    }

    pub async fn history(&self, scope: &PolicyScope) -> Result<Vec<PolicyRecord>, KernelError> {
        scope.validate()?;
        self.repo.policy_history(scope).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use tenantry_kernel::{InMemoryRepository, ManualClock};

    use super::*;

    fn engine() -> PolicyEngine {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        PolicyEngine::new(Arc::new(InMemoryRepository::new()), clock)
    }

    #[test]
    fn property_rule_overrides_global_and_absent_keys_fall_back() {
        let global = json!({
            "SEND_NOTICE": {"autoExecute": true},
            "CREATE_WORK_ORDER": {"autoExecute": true, "maxAmount": 500}
        });
        let property = json!({"SEND_NOTICE": {"deny": true}});
        let merged = merge_configs(Some(&global), Some(&property));
        let ctx = PolicyContext {
            amount: Some(200.0),
            ..PolicyContext::default()
        };

        assert!(!evaluate("SEND_NOTICE", &ctx, &merged).allowed);
        assert_eq!(
            evaluate("CREATE_WORK_ORDER", &ctx, &merged),
            evaluate("CREATE_WORK_ORDER", &ctx, &global)
        );
        let unknown = evaluate("ISSUE_REFUND", &ctx, &merged);
        assert!(unknown.allowed);
        assert!(unknown.requires_approval);
    }

    #[test]
    fn merge_is_shallow() {
        let global = json!({"CREATE_WORK_ORDER": {"autoExecute": true, "maxAmount": 500}});
        let property = json!({"CREATE_WORK_ORDER": {"autoExecute": true}});
        let merged = merge_configs(Some(&global), Some(&property));
        assert_eq!(merged["CREATE_WORK_ORDER"], json!({"autoExecute": true}));
    }

    #[test]
    fn predicates_fall_back_to_approval() {
        let config = json!({
            "CREATE_WORK_ORDER": {"autoExecute": true, "maxAmount": 500, "minConfidence": 0.8},
            "SEND_NOTICE": {"autoExecute": true, "maxSeverity": "MEDIUM"}
        });
        let over = PolicyContext {
            amount: Some(900.0),
            confidence: Some(0.9),
            ..PolicyContext::default()
        };
        assert!(evaluate("CREATE_WORK_ORDER", &over, &config).requires_approval);

        let unsure = PolicyContext {
            amount: Some(100.0),
            confidence: Some(0.5),
            ..PolicyContext::default()
        };
        assert!(evaluate("CREATE_WORK_ORDER", &unsure, &config).requires_approval);

        let missing = PolicyContext::default();
        assert!(evaluate("CREATE_WORK_ORDER", &missing, &config).requires_approval);

        let fine = PolicyContext {
            amount: Some(100.0),
            confidence: Some(0.95),
            ..PolicyContext::default()
        };
        assert!(evaluate("CREATE_WORK_ORDER", &fine, &config).permits_autonomy());

        let high = PolicyContext {
            severity: Some(Severity::High),
            ..PolicyContext::default()
        };
        assert!(evaluate("SEND_NOTICE", &high, &config).requires_approval);
    }

    #[test]
    fn rule_without_auto_execute_needs_approval() {
        let config = json!({"SEND_NOTICE": {"allowedSeverities": ["LOW"]}});
        let ctx = PolicyContext {
            severity: Some(Severity::Low),
            ..PolicyContext::default()
        };
        let decision = evaluate("SEND_NOTICE", &ctx, &config);
        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[test]
    fn config_validation_rejects_unknown_keys_and_shapes() {
        assert!(validate_config(&json!({"A": {"autoExecute": true}})).is_ok());
        assert!(validate_config(&json!([])).is_err());
        assert!(validate_config(&json!({"A": true})).is_err());
        assert!(validate_config(&json!({"A": {"autoexecute": true}})).is_err());
        assert!(validate_config(&json!({"A": {"maxSeverity": "EXTREME"}})).is_err());
    }

    #[tokio::test]
    async fn create_requires_admin_and_bumps_version() {
        let engine = engine();
        let config = json!({"SEND_NOTICE": {"autoExecute": true}});
        let err = engine
            .create_policy(
                &CallerIdentity::manager("mgr-1"),
                PolicyScope::global(),
                config.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Forbidden(_)));

        let admin = CallerIdentity::admin("root");
        let v1 = engine
            .create_policy(&admin, PolicyScope::global(), config.clone())
            .await
            .unwrap();
        let v2 = engine
            .create_policy(&admin, PolicyScope::global(), config)
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(engine.history(&PolicyScope::global()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_reports_layer_without_writing() {
        let engine = engine();
        let admin = CallerIdentity::admin("root");
        engine
            .create_policy(
                &admin,
                PolicyScope::global(),
                json!({"SEND_NOTICE": {"autoExecute": true}}),
            )
            .await
            .unwrap();

        let request = DryRunRequest {
            action_type: "SEND_NOTICE".into(),
            property_id: Some("p-1".into()),
            context: PolicyContext::default(),
            property_config: Some(json!({"SEND_NOTICE": {"deny": true}})),
        };
        let preview = engine.dry_run(&request).await.unwrap();
        assert!(!preview.decision.allowed);
        assert_eq!(preview.rule_source, RuleSource::Property);
        assert_eq!(preview.global_version, Some(1));
        assert!(engine
            .active(&PolicyScope::property("p-1"))
            .await
            .unwrap()
            .is_none());

        let stored = engine
            .dry_run(&DryRunRequest {
                property_config: None,
                ..request
            })
            .await
            .unwrap();
        assert!(stored.decision.permits_autonomy());
        assert_eq!(stored.rule_source, RuleSource::Global);
    }
}
