//! Rules and rule enforcements.
//!
//! A rule declaratively binds one trigger type plus a criteria map to one
//! action. A rule enforcement is the append-only audit record of one rule
//! firing for one trigger instance.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionId;
use crate::resource::ResourceRef;
use crate::trigger::TriggerInstanceId;

/// Unique identifier for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Creates a new random rule id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a rule enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnforcementId(Uuid);

impl EnforcementId {
    /// Creates a new random enforcement id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EnforcementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnforcementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One criterion in a rule's criteria map.
///
/// The operator names an entry in the operator registry; the pattern is the
/// operator's right-hand side. Existence operators take no pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Operator name, e.g. `equals`, `regex`, `timediff_lt`.
    #[serde(rename = "type")]
    pub operator: String,

    /// Operator pattern, absent for `exists`/`nexists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<serde_json::Value>,
}

impl Criterion {
    /// Creates a criterion with a pattern.
    #[must_use]
    pub fn new(operator: impl Into<String>, pattern: serde_json::Value) -> Self {
        Self {
            operator: operator.into(),
            pattern: Some(pattern),
        }
    }

    /// Creates a pattern-less criterion (`exists`/`nexists`).
    #[must_use]
    pub fn without_pattern(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            pattern: None,
        }
    }
}

/// The action a rule invokes on match, with parameter bindings.
///
/// Action definitions live outside the engine; the binding carries the
/// runner kind resolved from the definition at rule-save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBinding {
    /// The bound action's `pack.name`.
    #[serde(rename = "ref")]
    pub action: ResourceRef,

    /// The runner kind executing this action.
    pub runner_type: String,

    /// Parameters handed to the runner.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ActionBinding {
    /// Creates a binding with the given parameters.
    #[must_use]
    pub fn new(
        action: ResourceRef,
        runner_type: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            action,
            runner_type: runner_type.into(),
            parameters,
        }
    }
}

/// Declarative binding of a trigger type + criteria to an action.
///
/// Rules are read-only to the matching engine; mutation happens only through
/// the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id.
    pub id: RuleId,

    /// The `pack.name` identity.
    #[serde(rename = "ref")]
    pub reference: ResourceRef,

    /// The trigger type this rule listens for.
    pub trigger: ResourceRef,

    /// Criteria map: payload field path to criterion. All criteria must
    /// evaluate true for the rule to match (logical AND).
    #[serde(default)]
    pub criteria: BTreeMap<String, Criterion>,

    /// The action invoked on match.
    pub action: ActionBinding,

    /// Disabled rules are never matched.
    pub enabled: bool,
}

impl Rule {
    /// Creates an enabled rule with no criteria.
    #[must_use]
    pub fn new(reference: ResourceRef, trigger: ResourceRef, action: ActionBinding) -> Self {
        Self {
            id: RuleId::new(),
            reference,
            trigger,
            criteria: BTreeMap::new(),
            action,
            enabled: true,
        }
    }

    /// Adds one criterion.
    #[must_use]
    pub fn with_criterion(mut self, field: impl Into<String>, criterion: Criterion) -> Self {
        self.criteria.insert(field.into(), criterion);
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Audit record of one rule firing for one trigger instance.
///
/// Append-only: one record per successful match, whether or not the
/// resulting execution request succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEnforcement {
    /// Unique id.
    pub id: EnforcementId,

    /// The matched trigger instance.
    pub trigger_instance_id: TriggerInstanceId,

    /// The rule that fired.
    pub rule_id: RuleId,

    /// The rule's `pack.name` at enforcement time.
    pub rule_ref: ResourceRef,

    /// The requested execution, absent when the request itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,

    /// When the rule fired.
    pub enforced_at: DateTime<Utc>,

    /// Why the execution request failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl RuleEnforcement {
    /// Records a match whose execution request succeeded.
    #[must_use]
    pub fn succeeded(
        trigger_instance_id: TriggerInstanceId,
        rule: &Rule,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            id: EnforcementId::new(),
            trigger_instance_id,
            rule_id: rule.id,
            rule_ref: rule.reference.clone(),
            execution_id: Some(execution_id),
            enforced_at: Utc::now(),
            failure_reason: None,
        }
    }

    /// Records a match whose execution request failed.
    #[must_use]
    pub fn failed(
        trigger_instance_id: TriggerInstanceId,
        rule: &Rule,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: EnforcementId::new(),
            trigger_instance_id,
            rule_id: rule.id,
            rule_ref: rule.reference.clone(),
            execution_id: None,
            enforced_at: Utc::now(),
            failure_reason: Some(reason.into()),
        }
    }
}
