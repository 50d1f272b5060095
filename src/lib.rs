//! # Cascade - Event-Driven Automation Engine
//!
//! Cascade turns external events into tracked action executions. Sensors
//! produce events, the dispatcher records each one as a trigger instance,
//! the rule engine matches instances against declarative criteria, and
//! matched rules request executions whose outcomes are driven to completion
//! by the lifecycle manager and, for externally-orchestrated work, the
//! querier subsystem.
//!
//! ## Core Concepts
//!
//! - **Trigger Type**: registered schema/identity for a class of event
//! - **Trigger Instance**: one occurrence of an event, with payload
//! - **Rule**: binding of a trigger type + criteria map to one action
//! - **Rule Enforcement**: audit record of one rule firing once
//! - **Live Action**: one action invocation with a monotonic status
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cascade::{ActionBinding, Criterion, ResourceRef, Rule};
//! use serde_json::json;
//!
//! // Fire `ops.notify` whenever a prod deploy event arrives.
//! let rule = Rule::new(
//!     ResourceRef::new("ops", "on_prod_deploy"),
//!     ResourceRef::new("ops", "deploy_event"),
//!     ActionBinding::new(ResourceRef::new("ops", "notify"), "http", json!({})),
//! )
//! .with_criterion("env", Criterion::new("equals", json!("prod")));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod execution;
pub mod resource;
pub mod rule;
pub mod trigger;

// Criteria evaluation and storage
pub mod operators;
pub mod storage;

// Pipeline subsystems
pub mod config;
pub mod lifecycle;
pub mod querier;
pub mod reactor;
pub mod runner;
pub mod sensor;
pub mod transport;

// Re-export primary types at crate root for convenience
pub use config::{ApiConfig, EngineConfig};
pub use error::{BackendError, CascadeError, CascadeResult, ConfigError, MatchError, SensorError};
pub use execution::{ExecutionId, ExecutionStatus, LiveAction, QueryContext};
pub use lifecycle::ExecutionLifecycleManager;
pub use operators::OperatorRegistry;
pub use querier::{Querier, QuerierRegistry, QuerierScheduler, QuerierSchedulerConfig, QuerierTunables, QueryOutcome};
pub use reactor::{DispatchConfig, DispatchService, RuleMatcher, TriggerDispatcher, TriggerEmitter};
pub use resource::ResourceRef;
pub use rule::{ActionBinding, Criterion, EnforcementId, Rule, RuleEnforcement, RuleId};
pub use runner::{RunOutcome, RunStatus, Runner, RunnerRegistry};
pub use sensor::{
    ContainerConfig, PartitionPolicy, Sensor, SensorContainer, SensorContext, SensorInstance,
    SensorRunState, SensorSpec, TriggerUpdate,
};
pub use storage::{
    EnforcementStore, ExecutionStore, InMemoryStores, RuleStore, StorageError,
    TriggerInstanceStore, TriggerTypeStore,
};
pub use transport::{InProcessBus, Message, MessageBus, Subscription};
pub use trigger::{TriggerInstance, TriggerInstanceId, TriggerInstanceStatus, TriggerType};
