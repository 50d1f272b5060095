//! Trigger dispatch.
//!
//! `TriggerDispatcher` is the synchronous pipeline: persist an instance,
//! match rules, enforce matches, settle the instance status.
//! `DispatchService` runs that pipeline on a dedicated worker thread behind
//! a bounded queue; the `TriggerEmitter` handle it hands to sensors enqueues
//! with non-blocking `try_send` and never stalls a sensor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::{CascadeResult, ConfigError};
use crate::lifecycle::ExecutionLifecycleManager;
use crate::reactor::matcher::RuleMatcher;
use crate::resource::ResourceRef;
use crate::rule::RuleEnforcement;
use crate::storage::{EnforcementStore, RuleStore, TriggerInstanceStore, TriggerTypeStore};
use crate::transport::{routing_key, EventOp, MessageBus, TOPIC_TRIGGER_INSTANCE};
use crate::trigger::{TriggerInstance, TriggerInstanceId};

/// Dispatch service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Max queued emissions before sensor emissions are dropped.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

/// One queued sensor emission.
#[derive(Debug, Clone)]
pub(crate) struct Emission {
    pub(crate) trigger: ResourceRef,
    pub(crate) payload: serde_json::Value,
    pub(crate) occurred_at: DateTime<Utc>,
}

/// Non-blocking dispatch capability injected into sensors.
///
/// `emit` enqueues and returns; emissions that do not fit the queue are
/// dropped and counted rather than blocking the sensor.
#[derive(Debug, Clone)]
pub struct TriggerEmitter {
    tx: Sender<Emission>,
    dropped: Arc<AtomicU64>,
}

impl TriggerEmitter {
    /// Enqueues one emission, stamping the occurrence time.
    pub fn emit(&self, trigger: ResourceRef, payload: serde_json::Value) {
        self.emit_at(trigger, payload, Utc::now());
    }

    /// Enqueues one emission with an explicit occurrence time.
    pub fn emit_at(
        &self,
        trigger: ResourceRef,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) {
        let emission = Emission {
            trigger,
            payload,
            occurred_at,
        };
        match self.tx.try_send(emission) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Emissions dropped because the dispatch queue was full or closed.
    #[must_use]
    pub fn dropped_emissions(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Builds an emitter and its receiving end without a running service.
/// Used by tests that only need the sensor-facing side.
#[cfg(test)]
pub(crate) fn emitter_channel(capacity: usize) -> (TriggerEmitter, Receiver<Emission>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        TriggerEmitter {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Synchronous trigger dispatch pipeline.
pub struct TriggerDispatcher {
    trigger_types: Arc<dyn TriggerTypeStore>,
    instances: Arc<dyn TriggerInstanceStore>,
    rules: Arc<dyn RuleStore>,
    enforcements: Arc<dyn EnforcementStore>,
    matcher: RuleMatcher,
    lifecycle: Arc<ExecutionLifecycleManager>,
    bus: Arc<dyn MessageBus>,
}

impl TriggerDispatcher {
    /// Wires the dispatcher to its stores and collaborators.
    #[must_use]
    pub fn new(
        trigger_types: Arc<dyn TriggerTypeStore>,
        instances: Arc<dyn TriggerInstanceStore>,
        rules: Arc<dyn RuleStore>,
        enforcements: Arc<dyn EnforcementStore>,
        matcher: RuleMatcher,
        lifecycle: Arc<ExecutionLifecycleManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            trigger_types,
            instances,
            rules,
            enforcements,
            matcher,
            lifecycle,
            bus,
        }
    }

    /// Dispatches one event: persists a trigger instance, matches it
    /// against all enabled rules for the trigger type, and requests one
    /// execution per match.
    ///
    /// Individual enforcement failures are recorded on their enforcement
    /// and never abort the loop; the instance ends `Processed` once all
    /// matches were handled. Only a failure of rule loading/matching itself
    /// marks it `ProcessingFailed`.
    pub fn dispatch(
        &self,
        trigger: &ResourceRef,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> CascadeResult<TriggerInstanceId> {
        // Every instance must reference a registered trigger type.
        if self.trigger_types.get(trigger)?.is_none() {
            return Err(ConfigError::UnregisteredTriggerType {
                trigger: trigger.to_string(),
            }
            .into());
        }

        let mut instance = TriggerInstance::new(trigger.clone(), payload, occurred_at);
        let id = instance.id;
        self.instances.save(&instance)?;
        self.publish_event(EventOp::Create, &instance);

        let rules = match self.rules.find_enabled_for_trigger(trigger) {
            Ok(rules) => rules,
            Err(err) => {
                warn!(trigger_instance = %id, error = %err, "rule lookup failed");
                instance.mark_processing_failed(err.to_string());
                self.instances.save(&instance)?;
                self.publish_event(EventOp::Update, &instance);
                return Err(err.into());
            }
        };

        let matched = self.matcher.matching_rules(&instance, &rules);
        info!(
            trigger_instance = %id,
            trigger = %trigger,
            matched = matched.len(),
            "dispatching trigger instance"
        );

        for rule in &matched {
            let enforcement = match self.lifecycle.request_execution(
                rule.action.action.clone(),
                &rule.action.runner_type,
                rule.action.parameters.clone(),
            ) {
                Ok(execution_id) => {
                    debug!(rule = %rule.reference, execution = %execution_id, "rule enforced");
                    RuleEnforcement::succeeded(id, rule, execution_id)
                }
                Err(err) => {
                    warn!(rule = %rule.reference, error = %err, "rule enforcement failed");
                    RuleEnforcement::failed(id, rule, err.to_string())
                }
            };
            if let Err(err) = self.enforcements.save(&enforcement) {
                warn!(rule = %rule.reference, error = %err, "failed to record rule enforcement");
            }
        }

        instance.mark_processed();
        self.instances.save(&instance)?;
        self.publish_event(EventOp::Update, &instance);
        Ok(id)
    }

    fn publish_event(&self, op: EventOp, instance: &TriggerInstance) {
        let body = match serde_json::to_value(instance) {
            Ok(body) => body,
            Err(e) => {
                warn!(trigger_instance = %instance.id, error = %e, "failed to serialize instance event");
                return;
            }
        };
        let key = routing_key("trigger_instance", op);
        if let Err(e) = self.bus.publish(TOPIC_TRIGGER_INSTANCE, &key, body) {
            warn!(trigger_instance = %instance.id, error = %e, "failed to publish instance event");
        }
    }
}

impl std::fmt::Debug for TriggerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDispatcher").finish_non_exhaustive()
    }
}

/// Dispatch pipeline behind a bounded queue on a dedicated worker thread.
pub struct DispatchService {
    tx: Sender<Emission>,
    dropped: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchService {
    /// Starts the dispatch worker.
    #[must_use]
    pub fn start(dispatcher: Arc<TriggerDispatcher>, cfg: &DispatchConfig) -> Self {
        let (tx, rx) = bounded::<Emission>(cfg.queue_capacity.max(1));

        let join = thread::Builder::new()
            .name("cascade-dispatch".to_string())
            .spawn(move || worker_loop(&dispatcher, &rx))
            .expect("failed to spawn cascade dispatch worker");

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            join: Mutex::new(Some(join)),
        }
    }

    /// A dispatch capability for injection into sensors.
    #[must_use]
    pub fn emitter(&self) -> TriggerEmitter {
        TriggerEmitter {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Emissions dropped at the queue boundary.
    #[must_use]
    pub fn dropped_emissions(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        // Close our sender so the worker can terminate once all emitters
        // are gone.
        let (dummy_tx, _) = bounded::<Emission>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                // Do not join here.
                //
                // Sensors hold `TriggerEmitter` clones of the queue sender
                // and may outlive the service. Joining would block until
                // every emitter is dropped; detaching is safe because the
                // worker exits once the last sender is gone.
                drop(handle);
            }
        }
    }
}

fn worker_loop(dispatcher: &TriggerDispatcher, rx: &Receiver<Emission>) {
    while let Ok(emission) = rx.recv() {
        if let Err(err) =
            dispatcher.dispatch(&emission.trigger, emission.payload, emission.occurred_at)
        {
            // Dispatch failures are isolated per emission.
            warn!(trigger = %emission.trigger, error = %err, "dispatch failed");
        }
    }
}
