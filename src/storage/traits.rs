//! Abstract storage traits for cascade.
//!
//! The engine only needs a narrow CRUD capability from its document store:
//! get by id, get by name/ref, filtered get-all, add-or-update, delete. All
//! operations surface a distinguishable not-found condition: `get` returns
//! `Ok(None)` and mutations on missing records return the typed not-found
//! error.

use thiserror::Error;

use crate::execution::{ExecutionId, ExecutionStatus, LiveAction};
use crate::resource::ResourceRef;
use crate::rule::{EnforcementId, Rule, RuleEnforcement, RuleId};
use crate::trigger::{TriggerInstance, TriggerInstanceId, TriggerInstanceStatus, TriggerType};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Trigger type not found.
    #[error("Trigger type not found: {0}")]
    TriggerTypeNotFound(ResourceRef),

    /// Trigger instance not found.
    #[error("Trigger instance not found: {0}")]
    TriggerInstanceNotFound(TriggerInstanceId),

    /// Rule not found.
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    /// Enforcement not found.
    #[error("Rule enforcement not found: {0}")]
    EnforcementNotFound(EnforcementId),

    /// Execution not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<StorageError> for crate::error::CascadeError {
    fn from(err: StorageError) -> Self {
        Self::Backend(crate::error::BackendError::Storage {
            message: err.to_string(),
        })
    }
}

/// Storage for registered trigger types, keyed by `pack.name`.
pub trait TriggerTypeStore: Send + Sync {
    /// Adds or updates a trigger type.
    fn save(&self, trigger_type: &TriggerType) -> Result<(), StorageError>;

    /// Gets a trigger type by reference.
    fn get(&self, reference: &ResourceRef) -> Result<Option<TriggerType>, StorageError>;

    /// All registered trigger types.
    fn get_all(&self) -> Result<Vec<TriggerType>, StorageError>;

    /// Deletes a trigger type. Returns error if not found.
    fn delete(&self, reference: &ResourceRef) -> Result<(), StorageError>;
}

/// Storage for trigger instances.
pub trait TriggerInstanceStore: Send + Sync {
    /// Adds or updates a trigger instance.
    fn save(&self, instance: &TriggerInstance) -> Result<(), StorageError>;

    /// Gets an instance by id.
    fn get(&self, id: TriggerInstanceId) -> Result<Option<TriggerInstance>, StorageError>;

    /// All instances, any status.
    fn get_all(&self) -> Result<Vec<TriggerInstance>, StorageError>;

    /// Instances with the given processing status.
    fn find_by_status(
        &self,
        status: TriggerInstanceStatus,
    ) -> Result<Vec<TriggerInstance>, StorageError>;

    /// Deletes an instance. Returns error if not found.
    fn delete(&self, id: TriggerInstanceId) -> Result<(), StorageError>;
}

/// Storage for rules.
pub trait RuleStore: Send + Sync {
    /// Adds or updates a rule.
    fn save(&self, rule: &Rule) -> Result<(), StorageError>;

    /// Gets a rule by id.
    fn get(&self, id: RuleId) -> Result<Option<Rule>, StorageError>;

    /// Gets a rule by `pack.name`.
    fn get_by_ref(&self, reference: &ResourceRef) -> Result<Option<Rule>, StorageError>;

    /// All rules.
    fn get_all(&self) -> Result<Vec<Rule>, StorageError>;

    /// Enabled rules listening for the given trigger type.
    fn find_enabled_for_trigger(&self, trigger: &ResourceRef) -> Result<Vec<Rule>, StorageError>;

    /// Deletes a rule. Returns error if not found.
    fn delete(&self, id: RuleId) -> Result<(), StorageError>;
}

/// Storage for rule enforcements (append-only audit records).
pub trait EnforcementStore: Send + Sync {
    /// Adds an enforcement record.
    fn save(&self, enforcement: &RuleEnforcement) -> Result<(), StorageError>;

    /// Gets an enforcement by id.
    fn get(&self, id: EnforcementId) -> Result<Option<RuleEnforcement>, StorageError>;

    /// Enforcements recorded for a trigger instance.
    fn find_by_trigger_instance(
        &self,
        id: TriggerInstanceId,
    ) -> Result<Vec<RuleEnforcement>, StorageError>;

    /// Enforcements recorded for a rule.
    fn find_by_rule(&self, id: RuleId) -> Result<Vec<RuleEnforcement>, StorageError>;
}

/// Storage for action executions.
pub trait ExecutionStore: Send + Sync {
    /// Adds or updates an execution.
    fn save(&self, execution: &LiveAction) -> Result<(), StorageError>;

    /// Gets an execution by id.
    fn get(&self, id: ExecutionId) -> Result<Option<LiveAction>, StorageError>;

    /// All executions.
    fn get_all(&self) -> Result<Vec<LiveAction>, StorageError>;

    /// Executions with the given status.
    fn find_by_status(&self, status: ExecutionStatus) -> Result<Vec<LiveAction>, StorageError>;

    /// Deletes an execution. Returns error if not found.
    fn delete(&self, id: ExecutionId) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_trigger_type_store_object_safe(_: &dyn TriggerTypeStore) {}
    fn _assert_trigger_instance_store_object_safe(_: &dyn TriggerInstanceStore) {}
    fn _assert_rule_store_object_safe(_: &dyn RuleStore) {}
    fn _assert_enforcement_store_object_safe(_: &dyn EnforcementStore) {}
    fn _assert_execution_store_object_safe(_: &dyn ExecutionStore) {}

    #[test]
    fn storage_error_display() {
        let err = StorageError::TriggerTypeNotFound(ResourceRef::new("ops", "deploy_event"));
        assert!(err.to_string().contains("ops.deploy_event"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn storage_error_converts_to_backend_error() {
        let err: crate::error::CascadeError =
            StorageError::BackendError("down".to_string()).into();
        assert!(err.is_backend());
        assert!(err.is_retryable());
    }
}
