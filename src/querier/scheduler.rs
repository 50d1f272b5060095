//! Poll scheduling for outstanding executions.
//!
//! The scheduler multiplexes all pending executions over a fixed pool of
//! worker threads instead of one task per execution. A coordinator thread
//! owns a time-ordered queue and feeds due entries to workers through a
//! bounded channel; workers poll the backend and either forward a terminal
//! result to the lifecycle manager or reschedule the entry.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::error::{BackendError, CascadeError, CascadeResult};
use crate::execution::{ExecutionId, ExecutionStatus, QueryContext};
use crate::lifecycle::ExecutionLifecycleManager;
use crate::querier::QuerierRegistry;

/// Scheduler configuration.
///
/// The coordinator back-offs (`empty_q_sleep_time`, `no_workers_sleep_time`)
/// are process-wide; the per-execution poll gap comes from the owning
/// querier's declared `query_interval`.
#[derive(Debug, Clone)]
pub struct QuerierSchedulerConfig {
    /// Number of poll worker threads.
    pub workers: usize,

    /// Capacity of the coordinator-to-worker job channel.
    pub job_queue_capacity: usize,

    /// Capacity of the submit/cancel/reschedule control channel.
    pub control_queue_capacity: usize,

    /// Poll failures tolerated before an execution is marked failed.
    pub max_poll_failures: u32,

    /// Base back-off between retries of a failing poll; grows linearly with
    /// the failure count.
    pub retry_backoff: Duration,

    /// Sleep when the work queue is empty.
    pub empty_q_sleep_time: Duration,

    /// Sleep when all workers are saturated.
    pub no_workers_sleep_time: Duration,
}

impl Default for QuerierSchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            job_queue_capacity: 16,
            control_queue_capacity: 1024,
            max_poll_failures: 3,
            retry_backoff: Duration::from_millis(500),
            empty_q_sleep_time: Duration::from_secs(1),
            no_workers_sleep_time: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PollEntry {
    pub execution_id: ExecutionId,
    pub context: QueryContext,
    pub next_poll_at: DateTime<Utc>,
    pub last_query_time: Option<DateTime<Utc>>,
    pub failures: u32,
}

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Submit {
        execution_id: ExecutionId,
        context: QueryContext,
    },
    Reschedule {
        entry: PollEntry,
    },
    Cancel {
        execution_id: ExecutionId,
    },
}

#[derive(Debug)]
struct PollJob {
    entry: PollEntry,
}

// Min-heap ordering on next_poll_at; seq breaks ties FIFO.
struct QueueItem {
    seq: u64,
    entry: PollEntry,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.next_poll_at == other.entry.next_poll_at && self.seq == other.seq
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .entry
            .next_poll_at
            .cmp(&self.entry.next_poll_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle for submitting executions to (and removing them from) the poll
/// set. Held by the lifecycle manager; cheap to clone.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    control_tx: Sender<ControlMsg>,
    capacity: usize,
}

impl PollerHandle {
    /// Enqueues an execution for polling. Non-blocking.
    pub fn submit(&self, execution_id: ExecutionId, context: QueryContext) -> CascadeResult<()> {
        self.send(ControlMsg::Submit {
            execution_id,
            context,
        })
    }

    /// Removes an execution from the poll set. Non-blocking.
    pub fn cancel(&self, execution_id: ExecutionId) -> CascadeResult<()> {
        self.send(ControlMsg::Cancel { execution_id })
    }

    fn send(&self, msg: ControlMsg) -> CascadeResult<()> {
        match self.control_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CascadeError::Backend(BackendError::QueueFull {
                queue: "querier_control".to_string(),
                capacity: self.capacity,
            })),
            Err(TrySendError::Disconnected(_)) => {
                Err(CascadeError::Backend(BackendError::Disconnected {
                    queue: "querier_control".to_string(),
                }))
            }
        }
    }
}

/// Builds a poller handle and its receiving end without a running
/// scheduler. Used by tests that only need the submission side.
pub(crate) fn control_channel(capacity: usize) -> (PollerHandle, Receiver<ControlMsg>) {
    let (control_tx, control_rx) = bounded(capacity.max(1));
    (
        PollerHandle {
            control_tx,
            capacity,
        },
        control_rx,
    )
}

/// Bounded-concurrency poll scheduler.
///
/// Dropping the scheduler shuts it down deterministically: the coordinator
/// and workers are signalled and joined.
pub struct QuerierScheduler {
    control_tx: Sender<ControlMsg>,
    capacity: usize,
    shutdown: Arc<AtomicBool>,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl QuerierScheduler {
    /// Starts the coordinator and worker threads.
    #[must_use]
    pub fn start(
        registry: Arc<QuerierRegistry>,
        lifecycle: Arc<ExecutionLifecycleManager>,
        cfg: QuerierSchedulerConfig,
    ) -> Self {
        let workers = cfg.workers.max(1);
        let control_capacity = cfg.control_queue_capacity.max(1);
        let job_capacity = cfg.job_queue_capacity.max(1);

        let (control_tx, control_rx) = bounded::<ControlMsg>(control_capacity);
        let (job_tx, job_rx) = bounded::<PollJob>(job_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut worker_handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let job_rx = job_rx.clone();
            let control_tx = control_tx.clone();
            let registry = Arc::clone(&registry);
            let lifecycle = Arc::clone(&lifecycle);
            let cfg = cfg.clone();
            let handle = thread::Builder::new()
                .name(format!("cascade-querier-{idx}"))
                .spawn(move || worker_loop(&cfg, &registry, &lifecycle, &job_rx, &control_tx))
                .expect("failed to spawn cascade querier worker");
            worker_handles.push(handle);
        }

        let coordinator_cfg = cfg.clone();
        let coordinator_shutdown = Arc::clone(&shutdown);
        let coordinator = thread::Builder::new()
            .name("cascade-querier-coord".to_string())
            .spawn(move || {
                coordinator_loop(&coordinator_cfg, &coordinator_shutdown, &control_rx, &job_tx);
            })
            .expect("failed to spawn cascade querier coordinator");

        Self {
            control_tx,
            capacity: control_capacity,
            shutdown,
            coordinator: Some(coordinator),
            workers: worker_handles,
        }
    }

    /// A handle for submitting and canceling poll entries.
    #[must_use]
    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            control_tx: self.control_tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl Drop for QuerierScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Replace our control sender so the channel can fully disconnect
        // once external handles are gone.
        let (dummy_tx, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, dummy_tx));

        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        // The coordinator owned the job sender; workers exit once it is
        // gone and their queue drains.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}

fn coordinator_loop(
    cfg: &QuerierSchedulerConfig,
    shutdown: &AtomicBool,
    control_rx: &Receiver<ControlMsg>,
    job_tx: &Sender<PollJob>,
) {
    let mut heap: BinaryHeap<QueueItem> = BinaryHeap::new();
    let mut canceled: HashSet<ExecutionId> = HashSet::new();
    let mut seq: u64 = 0;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Drain control messages without blocking.
        loop {
            match control_rx.try_recv() {
                Ok(msg) => apply_control(msg, &mut heap, &mut canceled, &mut seq),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let now = Utc::now();
        let due = heap.peek().map(|item| item.entry.next_poll_at);
        match due {
            None => {
                // Empty work queue: block on control traffic, bounded.
                match control_rx.recv_timeout(cfg.empty_q_sleep_time) {
                    Ok(msg) => apply_control(msg, &mut heap, &mut canceled, &mut seq),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            }
            Some(due) if due <= now => {
                let Some(item) = heap.pop() else {
                    continue;
                };
                if canceled.remove(&item.entry.execution_id) {
                    debug!(execution = %item.entry.execution_id, "dropping canceled poll entry");
                    continue;
                }
                match job_tx.try_send(PollJob { entry: item.entry }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(job)) => {
                        // All workers saturated: put it back and back off.
                        heap.push(QueueItem {
                            seq: item.seq,
                            entry: job.entry,
                        });
                        thread::sleep(cfg.no_workers_sleep_time);
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            Some(due) => {
                // Head entry not yet due: wait for it or for control
                // traffic, whichever comes first.
                let wait = (due - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(cfg.empty_q_sleep_time);
                match control_rx.recv_timeout(wait) {
                    Ok(msg) => apply_control(msg, &mut heap, &mut canceled, &mut seq),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            }
        }
    }
}

fn apply_control(
    msg: ControlMsg,
    heap: &mut BinaryHeap<QueueItem>,
    canceled: &mut HashSet<ExecutionId>,
    seq: &mut u64,
) {
    match msg {
        ControlMsg::Submit {
            execution_id,
            context,
        } => {
            if canceled.remove(&execution_id) {
                return;
            }
            *seq += 1;
            heap.push(QueueItem {
                seq: *seq,
                entry: PollEntry {
                    execution_id,
                    context,
                    next_poll_at: Utc::now(),
                    last_query_time: None,
                    failures: 0,
                },
            });
        }
        ControlMsg::Reschedule { entry } => {
            if canceled.remove(&entry.execution_id) {
                debug!(execution = %entry.execution_id, "dropping canceled poll entry");
                return;
            }
            *seq += 1;
            heap.push(QueueItem { seq: *seq, entry });
        }
        ControlMsg::Cancel { execution_id } => {
            // Tombstone: matched and removed when the entry next surfaces,
            // whether from the heap or a worker reschedule.
            canceled.insert(execution_id);
        }
    }
}

fn worker_loop(
    cfg: &QuerierSchedulerConfig,
    registry: &QuerierRegistry,
    lifecycle: &ExecutionLifecycleManager,
    job_rx: &Receiver<PollJob>,
    control_tx: &Sender<ControlMsg>,
) {
    while let Ok(PollJob { mut entry }) = job_rx.recv() {
        let id = entry.execution_id;

        let querier = match registry.get(&entry.context.querier) {
            Ok(q) => q,
            Err(err) => {
                warn!(execution = %id, error = %err, "no querier for poll entry");
                complete_failed(lifecycle, id, err.to_string());
                continue;
            }
        };

        let now = Utc::now();
        match querier.query(id, &entry.context, entry.last_query_time) {
            Ok(outcome) if outcome.status.is_terminal() => {
                debug!(execution = %id, status = %outcome.status, "poll observed terminal status");
                if let Err(err) = lifecycle.complete(id, outcome.status, outcome.result, outcome.cause)
                {
                    warn!(execution = %id, error = %err, "failed to record polled result");
                }
            }
            Ok(_) => {
                entry.last_query_time = Some(now);
                entry.failures = 0;
                entry.next_poll_at = now + to_chrono(querier.tunables().query_interval);
                reschedule(control_tx, entry);
            }
            Err(err) => {
                entry.failures += 1;
                if entry.failures >= cfg.max_poll_failures {
                    warn!(
                        execution = %id,
                        attempts = entry.failures,
                        error = %err,
                        "querier exhausted poll attempts"
                    );
                    complete_failed(
                        lifecycle,
                        id,
                        format!(
                            "querier exhausted {} poll attempts: {err}",
                            entry.failures
                        ),
                    );
                } else {
                    let backoff = cfg.retry_backoff.saturating_mul(entry.failures);
                    debug!(execution = %id, attempt = entry.failures, "poll failed, backing off");
                    entry.next_poll_at = now + to_chrono(backoff);
                    reschedule(control_tx, entry);
                }
            }
        }
    }
}

fn reschedule(control_tx: &Sender<ControlMsg>, entry: PollEntry) {
    if control_tx.send(ControlMsg::Reschedule { entry }).is_err() {
        debug!("scheduler stopped; dropping poll entry");
    }
}

fn complete_failed(lifecycle: &ExecutionLifecycleManager, id: ExecutionId, cause: String) {
    if let Err(err) = lifecycle.complete(id, ExecutionStatus::Failed, serde_json::Value::Null, Some(cause))
    {
        warn!(execution = %id, error = %err, "failed to record poll failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::error::CascadeResult;
    use crate::querier::{Querier, QuerierTunables, QueryOutcome};
    use crate::resource::ResourceRef;
    use crate::runner::{RunOutcome, Runner, RunnerRegistry};
    use crate::storage::{ExecutionStore, InMemoryExecutionStore};
    use crate::transport::InProcessBus;

    struct PendingRunner {
        querier_kind: &'static str,
    }

    impl Runner for PendingRunner {
        fn run_type(&self) -> &str {
            "async"
        }

        fn pre_run(&mut self, _parameters: &serde_json::Value) -> CascadeResult<()> {
            Ok(())
        }

        fn run(&mut self, _parameters: serde_json::Value) -> CascadeResult<RunOutcome> {
            Ok(RunOutcome::pending(QueryContext::new(
                self.querier_kind,
                json!({"job_id": "j-1"}),
            )))
        }
    }

    struct ScriptedQuerier {
        kind: &'static str,
        outcomes: Mutex<VecDeque<CascadeResult<QueryOutcome>>>,
        calls: Mutex<Vec<DateTime<Utc>>>,
        tunables: QuerierTunables,
    }

    impl ScriptedQuerier {
        fn new(
            kind: &'static str,
            outcomes: Vec<CascadeResult<QueryOutcome>>,
            query_interval: Duration,
        ) -> Self {
            Self {
                kind,
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
                tunables: QuerierTunables {
                    query_interval,
                    empty_q_sleep_time: Duration::from_millis(20),
                    no_workers_sleep_time: Duration::from_millis(20),
                },
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_times(&self) -> Vec<DateTime<Utc>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Querier for ScriptedQuerier {
        fn kind(&self) -> &str {
            self.kind
        }

        fn query(
            &self,
            _execution_id: ExecutionId,
            _context: &QueryContext,
            _last_query_time: Option<DateTime<Utc>>,
        ) -> CascadeResult<QueryOutcome> {
            self.calls.lock().unwrap().push(Utc::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryOutcome::running()))
        }

        fn tunables(&self) -> QuerierTunables {
            self.tunables
        }
    }

    fn test_config() -> QuerierSchedulerConfig {
        QuerierSchedulerConfig {
            workers: 2,
            job_queue_capacity: 4,
            control_queue_capacity: 64,
            max_poll_failures: 3,
            retry_backoff: Duration::from_millis(10),
            empty_q_sleep_time: Duration::from_millis(20),
            no_workers_sleep_time: Duration::from_millis(20),
        }
    }

    struct Fixture {
        manager: Arc<ExecutionLifecycleManager>,
        store: Arc<InMemoryExecutionStore>,
        scheduler: QuerierScheduler,
    }

    fn fixture(querier: Arc<ScriptedQuerier>, kind: &'static str) -> Fixture {
        let store = Arc::new(InMemoryExecutionStore::new());
        let bus = Arc::new(InProcessBus::new(256));

        let mut runners = RunnerRegistry::new();
        runners.register(
            "async",
            Box::new(move || Box::new(PendingRunner { querier_kind: kind })),
        );

        let manager = Arc::new(ExecutionLifecycleManager::new(
            store.clone(),
            runners,
            bus,
        ));

        let mut registry = QuerierRegistry::new();
        registry.register(querier);

        let scheduler = QuerierScheduler::start(
            Arc::new(registry),
            Arc::clone(&manager),
            test_config(),
        );
        manager.attach_poller(scheduler.handle());

        Fixture {
            manager,
            store,
            scheduler,
        }
    }

    fn wait_for_terminal(
        store: &InMemoryExecutionStore,
        id: ExecutionId,
        timeout: Duration,
    ) -> Option<crate::execution::LiveAction> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Ok(Some(execution)) = store.get(id) {
                if execution.status.is_terminal() {
                    return Some(execution);
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn polls_until_terminal_and_completes_once() {
        let querier = Arc::new(ScriptedQuerier::new(
            "wf",
            vec![
                Ok(QueryOutcome::running()),
                Ok(QueryOutcome::running()),
                Ok(QueryOutcome::succeeded(json!({"exit": 0}))),
            ],
            Duration::from_millis(30),
        ));
        let f = fixture(Arc::clone(&querier), "wf");

        let id = f
            .manager
            .request_execution(ResourceRef::new("ops", "deploy"), "async", json!({}))
            .unwrap();

        let execution = wait_for_terminal(&f.store, id, Duration::from_secs(5)).expect("terminal");
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.result, json!({"exit": 0}));

        // Terminal executions leave the poll set: no further polls happen.
        let settled = querier.call_count();
        assert_eq!(settled, 3);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(querier.call_count(), settled);
    }

    #[test]
    fn respects_query_interval_between_polls() {
        let interval = Duration::from_millis(200);
        let querier = Arc::new(ScriptedQuerier::new(
            "wf",
            vec![
                Ok(QueryOutcome::running()),
                Ok(QueryOutcome::succeeded(json!(null))),
            ],
            interval,
        ));
        let f = fixture(Arc::clone(&querier), "wf");

        let id = f
            .manager
            .request_execution(ResourceRef::new("ops", "deploy"), "async", json!({}))
            .unwrap();
        wait_for_terminal(&f.store, id, Duration::from_secs(5)).expect("terminal");

        let times = querier.call_times();
        assert_eq!(times.len(), 2);
        let gap = times[1] - times[0];
        // Generous lower bound: the second poll never fires early.
        assert!(gap >= chrono::Duration::milliseconds(150), "gap was {gap}");
    }

    #[test]
    fn exhausted_retries_fail_with_distinct_cause() {
        fn backend_err() -> CascadeResult<QueryOutcome> {
            Err(CascadeError::Backend(BackendError::QuerierBackend {
                kind: "wf".to_string(),
                message: "gateway timeout".to_string(),
            }))
        }
        let querier = Arc::new(ScriptedQuerier::new(
            "wf",
            vec![backend_err(), backend_err(), backend_err()],
            Duration::from_millis(10),
        ));
        let f = fixture(Arc::clone(&querier), "wf");

        let id = f
            .manager
            .request_execution(ResourceRef::new("ops", "deploy"), "async", json!({}))
            .unwrap();

        let execution = wait_for_terminal(&f.store, id, Duration::from_secs(5)).expect("terminal");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let cause = execution.cause.unwrap();
        assert!(cause.contains("querier exhausted 3 poll attempts"), "{cause}");
        assert!(cause.contains("gateway timeout"), "{cause}");
        assert_eq!(querier.call_count(), 3);
    }

    #[test]
    fn canceled_execution_leaves_the_poll_set() {
        let querier = Arc::new(ScriptedQuerier::new(
            "wf",
            Vec::new(),
            Duration::from_millis(50),
        ));
        let f = fixture(Arc::clone(&querier), "wf");

        let id = f
            .manager
            .request_execution(ResourceRef::new("ops", "deploy"), "async", json!({}))
            .unwrap();
        f.manager.cancel(id).unwrap();

        let execution = wait_for_terminal(&f.store, id, Duration::from_secs(5)).expect("terminal");
        assert_eq!(execution.status, ExecutionStatus::Canceled);

        // Whatever polls slipped in before the cancel, none happen after it
        // settles.
        thread::sleep(Duration::from_millis(200));
        let settled = querier.call_count();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(querier.call_count(), settled);
        drop(f.scheduler);
    }

    #[test]
    fn unknown_querier_kind_fails_the_execution() {
        let querier = Arc::new(ScriptedQuerier::new(
            "registered",
            Vec::new(),
            Duration::from_millis(10),
        ));
        // Runner hands out a context naming an unregistered kind.
        let f = fixture(Arc::clone(&querier), "unregistered");

        let id = f
            .manager
            .request_execution(ResourceRef::new("ops", "deploy"), "async", json!({}))
            .unwrap();

        let execution = wait_for_terminal(&f.store, id, Duration::from_secs(5)).expect("terminal");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.cause.unwrap().contains("unregistered"));
        assert_eq!(querier.call_count(), 0);
    }

    #[test]
    fn shutdown_joins_workers() {
        let querier = Arc::new(ScriptedQuerier::new(
            "wf",
            Vec::new(),
            Duration::from_millis(10),
        ));
        let f = fixture(querier, "wf");
        // Dropping the scheduler must not hang even with an empty queue.
        drop(f.scheduler);
    }
}
