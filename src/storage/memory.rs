//! In-memory storage backend.
//!
//! Thread-safe in-memory implementations of the storage traits, intended for
//! embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::execution::{ExecutionId, ExecutionStatus, LiveAction};
use crate::resource::ResourceRef;
use crate::rule::{EnforcementId, Rule, RuleEnforcement, RuleId};
use crate::storage::traits::{
    EnforcementStore, ExecutionStore, RuleStore, StorageError, TriggerInstanceStore,
    TriggerTypeStore,
};
use crate::trigger::{TriggerInstance, TriggerInstanceId, TriggerInstanceStatus, TriggerType};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// In-memory trigger type store.
#[derive(Debug, Default)]
pub struct InMemoryTriggerTypeStore {
    state: RwLock<HashMap<ResourceRef, TriggerType>>,
}

impl InMemoryTriggerTypeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TriggerTypeStore for InMemoryTriggerTypeStore {
    fn save(&self, trigger_type: &TriggerType) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger_types"))?;
        state.insert(trigger_type.reference.clone(), trigger_type.clone());
        Ok(())
    }

    fn get(&self, reference: &ResourceRef) -> Result<Option<TriggerType>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger_types"))?;
        Ok(state.get(reference).cloned())
    }

    fn get_all(&self) -> Result<Vec<TriggerType>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger_types"))?;
        Ok(state.values().cloned().collect())
    }

    fn delete(&self, reference: &ResourceRef) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger_types"))?;
        state
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| StorageError::TriggerTypeNotFound(reference.clone()))
    }
}

/// In-memory trigger instance store.
#[derive(Debug, Default)]
pub struct InMemoryTriggerInstanceStore {
    state: RwLock<HashMap<TriggerInstanceId, TriggerInstance>>,
}

impl InMemoryTriggerInstanceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TriggerInstanceStore for InMemoryTriggerInstanceStore {
    fn save(&self, instance: &TriggerInstance) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger_instances"))?;
        state.insert(instance.id, instance.clone());
        Ok(())
    }

    fn get(&self, id: TriggerInstanceId) -> Result<Option<TriggerInstance>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger_instances"))?;
        Ok(state.get(&id).cloned())
    }

    fn get_all(&self) -> Result<Vec<TriggerInstance>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger_instances"))?;
        Ok(state.values().cloned().collect())
    }

    fn find_by_status(
        &self,
        status: TriggerInstanceStatus,
    ) -> Result<Vec<TriggerInstance>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger_instances"))?;
        Ok(state
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    fn delete(&self, id: TriggerInstanceId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger_instances"))?;
        state
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::TriggerInstanceNotFound(id))
    }
}

/// In-memory rule store.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    state: RwLock<HashMap<RuleId, Rule>>,
}

impl InMemoryRuleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for InMemoryRuleStore {
    fn save(&self, rule: &Rule) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("rules"))?;
        state.insert(rule.id, rule.clone());
        Ok(())
    }

    fn get(&self, id: RuleId) -> Result<Option<Rule>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rules"))?;
        Ok(state.get(&id).cloned())
    }

    fn get_by_ref(&self, reference: &ResourceRef) -> Result<Option<Rule>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rules"))?;
        Ok(state.values().find(|r| &r.reference == reference).cloned())
    }

    fn get_all(&self) -> Result<Vec<Rule>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rules"))?;
        Ok(state.values().cloned().collect())
    }

    fn find_enabled_for_trigger(&self, trigger: &ResourceRef) -> Result<Vec<Rule>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rules"))?;
        Ok(state
            .values()
            .filter(|r| r.enabled && &r.trigger == trigger)
            .cloned()
            .collect())
    }

    fn delete(&self, id: RuleId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("rules"))?;
        state.remove(&id).map(|_| ()).ok_or(StorageError::RuleNotFound(id))
    }
}

/// In-memory enforcement store.
#[derive(Debug, Default)]
pub struct InMemoryEnforcementStore {
    state: RwLock<HashMap<EnforcementId, RuleEnforcement>>,
}

impl InMemoryEnforcementStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnforcementStore for InMemoryEnforcementStore {
    fn save(&self, enforcement: &RuleEnforcement) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("enforcements"))?;
        state.insert(enforcement.id, enforcement.clone());
        Ok(())
    }

    fn get(&self, id: EnforcementId) -> Result<Option<RuleEnforcement>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("enforcements"))?;
        Ok(state.get(&id).cloned())
    }

    fn find_by_trigger_instance(
        &self,
        id: TriggerInstanceId,
    ) -> Result<Vec<RuleEnforcement>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("enforcements"))?;
        Ok(state
            .values()
            .filter(|e| e.trigger_instance_id == id)
            .cloned()
            .collect())
    }

    fn find_by_rule(&self, id: RuleId) -> Result<Vec<RuleEnforcement>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("enforcements"))?;
        Ok(state.values().filter(|e| e.rule_id == id).cloned().collect())
    }
}

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    state: RwLock<HashMap<ExecutionId, LiveAction>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save(&self, execution: &LiveAction) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("executions"))?;
        state.insert(execution.id, execution.clone());
        Ok(())
    }

    fn get(&self, id: ExecutionId) -> Result<Option<LiveAction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("executions"))?;
        Ok(state.get(&id).cloned())
    }

    fn get_all(&self) -> Result<Vec<LiveAction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("executions"))?;
        Ok(state.values().cloned().collect())
    }

    fn find_by_status(&self, status: ExecutionStatus) -> Result<Vec<LiveAction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("executions"))?;
        Ok(state
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    fn delete(&self, id: ExecutionId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("executions"))?;
        state
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::ExecutionNotFound(id))
    }
}

/// Bundle of all in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Trigger type store.
    pub trigger_types: InMemoryTriggerTypeStore,
    /// Trigger instance store.
    pub trigger_instances: InMemoryTriggerInstanceStore,
    /// Rule store.
    pub rules: InMemoryRuleStore,
    /// Enforcement store.
    pub enforcements: InMemoryEnforcementStore,
    /// Execution store.
    pub executions: InMemoryExecutionStore,
}
