//! Sensors and their supervision.
//!
//! A sensor is a long-running event producer. The container owns the
//! lifecycle of every sensor assigned to this process: start, run, cleanup,
//! crash-restart, and trigger (de)registration for programmable sensors.
//! The partition assigner decides which sensors this process runs.

/// Sensor supervision.
pub mod container;
/// Fleet partition assignment.
pub mod partition;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::error::CascadeResult;
use crate::reactor::TriggerEmitter;
use crate::resource::ResourceRef;
use crate::trigger::TriggerType;

pub use container::{ContainerConfig, SensorContainer};
pub use partition::{hash_partition, PartitionLookup, PartitionPolicy};

/// Static description of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// The `pack.name` identity.
    #[serde(rename = "ref")]
    pub reference: ResourceRef,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Overrides the partition hash key; defaults to the reference string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl SensorSpec {
    /// Creates a spec for the given reference.
    #[must_use]
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            description: None,
            partition_key: None,
        }
    }

    /// Sets a custom partition key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// The key used for partition assignment.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.partition_key
            .clone()
            .unwrap_or_else(|| self.reference.to_string())
    }
}

/// Run state of a supervised sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRunState {
    /// Registered but not running.
    Stopped,

    /// Setup in progress.
    Starting,

    /// Run loop active.
    Running,

    /// Exhausted restart attempts.
    Crashed,
}

impl std::fmt::Display for SensorRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one supervised sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInstance {
    /// The sensor's `pack.name`.
    pub reference: ResourceRef,

    /// Current run state.
    pub state: SensorRunState,

    /// Restart attempts consumed so far.
    pub restarts: u32,

    /// The last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A change to the registered trigger types, delivered to programmable
/// sensors through their context.
#[derive(Debug, Clone)]
pub enum TriggerUpdate {
    /// A trigger type was registered.
    Registered(TriggerType),

    /// A trigger type was redefined.
    Updated(TriggerType),

    /// A trigger type was removed.
    Removed(ResourceRef),
}

/// Capabilities handed to a running sensor.
///
/// Carries the dispatch capability, the shutdown flag the run loop must
/// poll, and the stream of trigger updates for programmable sensors.
#[derive(Debug)]
pub struct SensorContext {
    shutdown: Arc<AtomicBool>,
    emitter: TriggerEmitter,
    trigger_updates: Receiver<TriggerUpdate>,
}

impl SensorContext {
    pub(crate) fn new(
        shutdown: Arc<AtomicBool>,
        emitter: TriggerEmitter,
        trigger_updates: Receiver<TriggerUpdate>,
    ) -> Self {
        Self {
            shutdown,
            emitter,
            trigger_updates,
        }
    }

    /// True once the container has requested a stop. Long-running `run`
    /// loops must poll this.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration`, waking early on stop. Returns false if a stop
    /// was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        while std::time::Instant::now() < deadline {
            if self.should_stop() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        !self.should_stop()
    }

    /// The dispatch capability. Emissions enqueue and return; they never
    /// block the sensor.
    #[must_use]
    pub fn emitter(&self) -> &TriggerEmitter {
        &self.emitter
    }

    /// Emits one event into the dispatch pipeline.
    pub fn dispatch(&self, trigger: ResourceRef, payload: serde_json::Value) {
        self.emitter.emit(trigger, payload);
    }

    /// Takes the next pending trigger update, if any. Programmable sensors
    /// drain this inside their run loop and apply the updates to
    /// themselves.
    #[must_use]
    pub fn next_trigger_update(&self) -> Option<TriggerUpdate> {
        self.trigger_updates.try_recv().ok()
    }
}

/// A long-running event producer.
///
/// `run` is expected to block until the context signals a stop; returning
/// early (or failing) triggers a supervised restart. The trigger methods
/// are only meaningful for programmable sensors and default to no-ops.
pub trait Sensor: Send {
    /// One-time initialization before `run`.
    fn setup(&mut self, _ctx: &SensorContext) -> CascadeResult<()> {
        Ok(())
    }

    /// The sensor's event loop.
    fn run(&mut self, ctx: &SensorContext) -> CascadeResult<()>;

    /// Releases resources after `run` returns. Called on every exit,
    /// including before a restart.
    fn cleanup(&mut self) -> CascadeResult<()> {
        Ok(())
    }

    /// A trigger type relevant to this sensor was registered.
    fn add_trigger(&mut self, _trigger: &TriggerType) {}

    /// A trigger type relevant to this sensor was redefined.
    fn update_trigger(&mut self, _trigger: &TriggerType) {}

    /// A trigger type relevant to this sensor was removed.
    fn remove_trigger(&mut self, _trigger: &ResourceRef) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::reactor::dispatcher::emitter_channel;

    #[test]
    fn partition_key_defaults_to_reference() {
        let spec = SensorSpec::new(ResourceRef::new("linux", "file_watch"));
        assert_eq!(spec.partition_key(), "linux.file_watch");

        let custom = spec.with_partition_key("pinned-key");
        assert_eq!(custom.partition_key(), "pinned-key");
    }

    #[test]
    fn context_sleep_wakes_on_stop() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (emitter, _rx) = emitter_channel(4);
        let (_tx, updates) = crossbeam_channel::bounded(1);
        let ctx = SensorContext::new(Arc::clone(&shutdown), emitter, updates);

        let flag = Arc::clone(&shutdown);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            flag.store(true, Ordering::Relaxed);
        });

        let started = std::time::Instant::now();
        let completed = ctx.sleep(Duration::from_secs(10));
        stopper.join().unwrap();

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn context_delivers_trigger_updates_in_order() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (emitter, _rx) = emitter_channel(4);
        let (tx, updates) = crossbeam_channel::bounded(4);
        let ctx = SensorContext::new(shutdown, emitter, updates);

        assert!(ctx.next_trigger_update().is_none());

        let tt = TriggerType::new(ResourceRef::new("ops", "deploy_event"));
        tx.send(TriggerUpdate::Registered(tt.clone())).unwrap();
        tx.send(TriggerUpdate::Removed(tt.reference.clone())).unwrap();

        assert!(matches!(
            ctx.next_trigger_update(),
            Some(TriggerUpdate::Registered(_))
        ));
        assert!(matches!(
            ctx.next_trigger_update(),
            Some(TriggerUpdate::Removed(_))
        ));
        assert!(ctx.next_trigger_update().is_none());
    }

    #[test]
    fn sensor_run_state_display() {
        assert_eq!(SensorRunState::Running.to_string(), "running");
        assert_eq!(SensorRunState::Crashed.to_string(), "crashed");
    }
}
