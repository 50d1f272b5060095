//! Storage trait definitions for cascade.
//!
//! These traits define the abstract interface the engine needs from a
//! document store. The in-memory backend is the reference implementation
//! used by tests and embedded deployments.

mod memory;
mod traits;

pub use memory::{
    InMemoryEnforcementStore, InMemoryExecutionStore, InMemoryRuleStore, InMemoryStores,
    InMemoryTriggerInstanceStore, InMemoryTriggerTypeStore,
};
pub use traits::{
    EnforcementStore, ExecutionStore, RuleStore, StorageError, TriggerInstanceStore,
    TriggerTypeStore,
};
