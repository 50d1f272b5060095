//! Sensor supervision.
//!
//! The container runs one named thread per assigned sensor and blocks on
//! all of them. A sensor that returns, fails, or panics is restarted with
//! bounded exponential backoff; a sensor that exhausts its restart budget
//! is marked crashed without affecting the others. Stopping waits a grace
//! period per sensor and then forcibly reclaims it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{error, info, warn};

use crate::reactor::TriggerEmitter;
use crate::sensor::{Sensor, SensorContext, SensorInstance, SensorRunState, SensorSpec, TriggerUpdate};

/// Supervision configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Restart attempts per sensor before it is marked crashed.
    pub max_restarts: u32,

    /// Base backoff before a restart; doubles per consecutive failure.
    pub restart_backoff: Duration,

    /// Upper bound on the restart backoff.
    pub restart_backoff_cap: Duration,

    /// How long `stop_all` waits for a sensor to exit before forcibly
    /// reclaiming it.
    pub stop_grace_period: Duration,

    /// Per-sensor trigger update queue capacity.
    pub trigger_update_capacity: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_backoff: Duration::from_secs(1),
            restart_backoff_cap: Duration::from_secs(60),
            stop_grace_period: Duration::from_secs(5),
            trigger_update_capacity: 128,
        }
    }
}

#[derive(Debug)]
struct SensorShared {
    state: Mutex<SensorRunState>,
    restarts: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl SensorShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SensorRunState::Stopped),
            restarts: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn set_state(&self, state: SensorRunState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn state(&self) -> SensorRunState {
        self.state.lock().map_or(SensorRunState::Crashed, |g| *g)
    }

    fn record_error(&self, message: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(message);
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }
}

struct RunningSensor {
    spec: SensorSpec,
    shutdown: Arc<AtomicBool>,
    shared: Arc<SensorShared>,
    trigger_tx: Sender<TriggerUpdate>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the lifecycle of all sensors assigned to this process.
pub struct SensorContainer {
    cfg: ContainerConfig,
    emitter: TriggerEmitter,
    pending: Mutex<Vec<(SensorSpec, Box<dyn Sensor>)>>,
    running: Mutex<Vec<RunningSensor>>,
}

impl SensorContainer {
    /// Creates a container dispatching through `emitter`.
    #[must_use]
    pub fn new(cfg: ContainerConfig, emitter: TriggerEmitter) -> Self {
        Self {
            cfg,
            emitter,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Registers a sensor for the next `start_all`.
    pub fn register(&self, spec: SensorSpec, sensor: Box<dyn Sensor>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((spec, sensor));
        }
    }

    /// Starts every registered-but-not-started sensor, one thread each.
    pub fn start_all(&self) {
        let drained: Vec<(SensorSpec, Box<dyn Sensor>)> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => {
                warn!("pending sensor lock poisoned; nothing started");
                return;
            }
        };

        for (spec, sensor) in drained {
            self.spawn_sensor(spec, sensor);
        }
    }

    fn spawn_sensor(&self, spec: SensorSpec, sensor: Box<dyn Sensor>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(SensorShared::new());
        let (trigger_tx, trigger_rx) = bounded(self.cfg.trigger_update_capacity.max(1));
        let (done_tx, done_rx) = bounded(1);

        let ctx = SensorContext::new(Arc::clone(&shutdown), self.emitter.clone(), trigger_rx);
        let thread_cfg = self.cfg.clone();
        let thread_shared = Arc::clone(&shared);
        let name = spec.reference.to_string();

        let handle = thread::Builder::new()
            .name(format!("cascade-sensor-{name}"))
            .spawn(move || {
                sensor_loop(sensor, &ctx, &thread_shared, &thread_cfg, &name);
                let _ = done_tx.send(());
            })
            .expect("failed to spawn cascade sensor thread");

        if let Ok(mut running) = self.running.lock() {
            running.push(RunningSensor {
                spec,
                shutdown,
                shared,
                trigger_tx,
                done_rx,
                handle: Some(handle),
            });
        }
    }

    /// Requests every sensor to stop, waits the grace period for each, and
    /// forcibly reclaims stragglers.
    pub fn stop_all(&self) {
        let mut sensors: Vec<RunningSensor> = match self.running.lock() {
            Ok(mut running) => running.drain(..).collect(),
            Err(_) => return,
        };

        // Signal everyone before waiting on anyone.
        for sensor in &sensors {
            sensor.shutdown.store(true, Ordering::Relaxed);
        }

        for sensor in &mut sensors {
            match sensor.done_rx.recv_timeout(self.cfg.stop_grace_period) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    if let Some(handle) = sensor.handle.take() {
                        let _ = handle.join();
                    }
                    info!(sensor = %sensor.spec.reference, "sensor stopped");
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    warn!(
                        sensor = %sensor.spec.reference,
                        grace_ms = self.cfg.stop_grace_period.as_millis() as u64,
                        "sensor did not stop within grace period, forcibly reclaiming"
                    );
                    // Detach: the thread keeps the right to finish, but the
                    // container no longer waits on it.
                    drop(sensor.handle.take());
                }
            }
        }
    }

    /// Blocks until every sensor thread has exited.
    pub fn wait(&self) {
        let sensors: Vec<RunningSensor> = match self.running.lock() {
            Ok(mut running) => running.drain(..).collect(),
            Err(_) => return,
        };
        for mut sensor in sensors {
            if let Some(handle) = sensor.handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Snapshot of all supervised sensors.
    #[must_use]
    pub fn status(&self) -> Vec<SensorInstance> {
        let mut out = Vec::new();
        if let Ok(pending) = self.pending.lock() {
            for (spec, _) in pending.iter() {
                out.push(SensorInstance {
                    reference: spec.reference.clone(),
                    state: SensorRunState::Stopped,
                    restarts: 0,
                    last_error: None,
                });
            }
        }
        if let Ok(running) = self.running.lock() {
            for sensor in running.iter() {
                out.push(SensorInstance {
                    reference: sensor.spec.reference.clone(),
                    state: sensor.shared.state(),
                    restarts: sensor.shared.restarts.load(Ordering::Relaxed),
                    last_error: sensor.shared.last_error(),
                });
            }
        }
        out
    }

    /// Forwards a trigger type change to every running sensor.
    pub fn broadcast_trigger_update(&self, update: &TriggerUpdate) {
        let Ok(running) = self.running.lock() else {
            return;
        };
        for sensor in running.iter() {
            match sensor.trigger_tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(sensor = %sensor.spec.reference, "trigger update queue full, update dropped");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

impl std::fmt::Debug for SensorContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorContainer")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn sensor_loop(
    mut sensor: Box<dyn Sensor>,
    ctx: &SensorContext,
    shared: &SensorShared,
    cfg: &ContainerConfig,
    name: &str,
) {
    let mut attempt: u32 = 0;

    loop {
        if ctx.should_stop() {
            shared.set_state(SensorRunState::Stopped);
            break;
        }

        shared.set_state(SensorRunState::Starting);
        let run_result = match sensor.setup(ctx) {
            Ok(()) => {
                shared.set_state(SensorRunState::Running);
                panic::catch_unwind(AssertUnwindSafe(|| sensor.run(ctx)))
            }
            Err(err) => Ok(Err(err)),
        };

        if let Err(err) = sensor.cleanup() {
            warn!(sensor = name, error = %err, "sensor cleanup failed");
        }

        match run_result {
            Ok(Ok(())) if ctx.should_stop() => {
                info!(sensor = name, "sensor stopped");
                shared.set_state(SensorRunState::Stopped);
                break;
            }
            Ok(Ok(())) => {
                warn!(sensor = name, "sensor run loop exited unexpectedly");
                shared.record_error("run loop exited unexpectedly".to_string());
            }
            Ok(Err(err)) => {
                warn!(sensor = name, error = %err, "sensor failed");
                shared.record_error(err.to_string());
            }
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                warn!(sensor = name, reason = %reason, "sensor panicked");
                shared.record_error(format!("panicked: {reason}"));
            }
        }

        attempt += 1;
        shared.restarts.store(attempt, Ordering::Relaxed);
        if attempt > cfg.max_restarts {
            error!(sensor = name, attempts = attempt - 1, "sensor exhausted restart attempts");
            shared.set_state(SensorRunState::Crashed);
            break;
        }

        let backoff = cfg
            .restart_backoff
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(cfg.restart_backoff_cap);
        info!(sensor = name, attempt, backoff_ms = backoff.as_millis() as u64, "restarting sensor");
        if !ctx.sleep(backoff) {
            shared.set_state(SensorRunState::Stopped);
            break;
        }
    }
}
