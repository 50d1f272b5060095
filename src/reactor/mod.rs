//! Trigger dispatch and rule matching.
//!
//! Sensors emit (trigger type, payload) pairs; the dispatcher persists a
//! trigger instance for each emission, matches it against the enabled rules
//! for that trigger type, and requests one action execution per match. Rules
//! are independent: a failing rule or enforcement never blocks the others.

/// Trigger instance creation, matching, and enforcement.
pub mod dispatcher;
/// Criteria evaluation against trigger instances.
pub mod matcher;

pub use dispatcher::{DispatchConfig, DispatchService, TriggerDispatcher, TriggerEmitter};
pub use matcher::RuleMatcher;
