//! Execution lifecycle management.
//!
//! The lifecycle manager drives an action invocation through its pre-run,
//! run, and post-run phases and is the sole writer of execution status.
//! Synchronous runners complete within `request_execution`; async runners
//! report a pending outcome and ownership of the execution moves to the
//! querier scheduler, which calls back into [`ExecutionLifecycleManager::complete`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::error::{BackendError, CascadeError, CascadeResult};
use crate::execution::{ExecutionId, ExecutionStatus, LiveAction};
use crate::querier::PollerHandle;
use crate::resource::ResourceRef;
use crate::runner::{RunOutcome, RunStatus, Runner, RunnerRegistry};
use crate::storage::ExecutionStore;
use crate::transport::{routing_key, EventOp, MessageBus, TOPIC_EXECUTION};

/// Callback invoked exactly once per execution when a terminal status is
/// recorded, keyed by runner kind.
pub type ResultCallback = Box<dyn Fn(&LiveAction) + Send + Sync>;

/// Drives action invocations through their status lifecycle.
pub struct ExecutionLifecycleManager {
    executions: Arc<dyn ExecutionStore>,
    runners: RunnerRegistry,
    callbacks: RwLock<HashMap<String, ResultCallback>>,
    bus: Arc<dyn MessageBus>,
    poller: RwLock<Option<PollerHandle>>,
}

impl ExecutionLifecycleManager {
    /// Creates a manager over the given store, runner registry, and bus.
    #[must_use]
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        runners: RunnerRegistry,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            executions,
            runners,
            callbacks: RwLock::new(HashMap::new()),
            bus,
            poller: RwLock::new(None),
        }
    }

    /// Attaches the querier scheduler handle used for pending outcomes.
    pub fn attach_poller(&self, handle: PollerHandle) {
        if let Ok(mut guard) = self.poller.write() {
            *guard = Some(handle);
        }
    }

    /// Registers the result callback for a runner kind.
    pub fn register_callback(&self, runner_type: impl Into<String>, callback: ResultCallback) {
        if let Ok(mut guard) = self.callbacks.write() {
            guard.insert(runner_type.into(), callback);
        }
    }

    /// Requests one execution of `action` and drives it as far as the
    /// runner allows.
    ///
    /// Synchronous runners reach a terminal status before this returns.
    /// Pending runners leave the execution `Running` with its query context
    /// attached and enqueued for polling. Parameter validation failures
    /// terminate the execution `Failed` with the configuration error as its
    /// cause; the id is still returned so enforcements can link the record.
    pub fn request_execution(
        &self,
        action: ResourceRef,
        runner_type: &str,
        parameters: serde_json::Value,
    ) -> CascadeResult<ExecutionId> {
        // Unknown runner kinds fail before anything is persisted.
        let mut runner = self.runners.build(runner_type)?;

        let mut execution = LiveAction::new(action, runner_type, parameters.clone());
        let id = execution.id;
        self.executions.save(&execution)?;
        self.publish_event(EventOp::Create, &execution);
        info!(execution = %id, action = %execution.action, runner = runner_type, "execution requested");

        self.advance(&mut execution, ExecutionStatus::Scheduling)?;
        self.advance(&mut execution, ExecutionStatus::Scheduled)?;

        if let Err(err) = runner.pre_run(&parameters) {
            warn!(execution = %id, error = %err, "runner pre_run rejected parameters");
            runner.post_run();
            self.finalize(
                &mut execution,
                ExecutionStatus::Failed,
                serde_json::Value::Null,
                Some(err.to_string()),
            )?;
            return Ok(id);
        }

        self.advance(&mut execution, ExecutionStatus::Running)?;

        match runner.run(parameters) {
            Ok(outcome) => {
                runner.post_run();
                self.apply_run_outcome(&mut execution, outcome)?;
            }
            Err(err) => {
                warn!(execution = %id, error = %err, "runner failed");
                runner.post_run();
                self.finalize(
                    &mut execution,
                    ExecutionStatus::Failed,
                    serde_json::Value::Null,
                    Some(err.to_string()),
                )?;
            }
        }

        Ok(id)
    }

    fn apply_run_outcome(
        &self,
        execution: &mut LiveAction,
        outcome: RunOutcome,
    ) -> CascadeResult<()> {
        if outcome.status == RunStatus::Pending {
            let Some(context) = outcome.query_context else {
                self.finalize(
                    execution,
                    ExecutionStatus::Failed,
                    serde_json::Value::Null,
                    Some("runner reported pending without a query context".to_string()),
                )?;
                return Ok(());
            };

            let handle = self
                .poller
                .read()
                .ok()
                .and_then(|guard| guard.clone());
            let Some(handle) = handle else {
                self.finalize(
                    execution,
                    ExecutionStatus::Failed,
                    serde_json::Value::Null,
                    Some("no querier scheduler attached for pending execution".to_string()),
                )?;
                return Ok(());
            };

            execution.query_context = Some(context.clone());
            self.executions.save(execution)?;
            self.publish_event(EventOp::Update, execution);

            if let Err(err) = handle.submit(execution.id, context) {
                self.finalize(
                    execution,
                    ExecutionStatus::Failed,
                    serde_json::Value::Null,
                    Some(format!("failed to enqueue execution for polling: {err}")),
                )?;
                return Ok(());
            }

            debug!(execution = %execution.id, "execution handed to querier scheduler");
            return Ok(());
        }

        // Finished runs map directly onto the status machine.
        let status = outcome
            .status
            .as_execution_status()
            .ok_or_else(|| CascadeError::internal("unmapped run status"))?;
        self.finalize(execution, status, outcome.result, outcome.cause)
    }

    /// Records a terminal result for an execution.
    ///
    /// The single result sink: invoked by the synchronous run path and by
    /// querier workers. Completing an already-terminal execution is a
    /// no-op, which makes the result callback exactly-once.
    pub fn complete(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        result: serde_json::Value,
        cause: Option<String>,
    ) -> CascadeResult<()> {
        if !status.is_terminal() {
            return Err(CascadeError::internal(format!(
                "complete called with non-terminal status '{status}'"
            )));
        }

        let mut execution = self.load(id)?;
        if execution.status.is_terminal() {
            debug!(execution = %id, status = %execution.status, "ignoring duplicate completion");
            return Ok(());
        }

        self.finalize(&mut execution, status, result, cause)
    }

    /// Cancels an in-flight execution.
    ///
    /// Moves through `Canceling` and settles on `Canceled` once the poll
    /// set has acknowledged removal. Canceling a terminal execution is a
    /// no-op.
    pub fn cancel(&self, id: ExecutionId) -> CascadeResult<()> {
        let mut execution = self.load(id)?;
        if execution.status.is_terminal() {
            debug!(execution = %id, "cancel requested for terminal execution");
            return Ok(());
        }

        self.advance(&mut execution, ExecutionStatus::Canceling)?;

        if execution.query_context.is_some() {
            let handle = self
                .poller
                .read()
                .ok()
                .and_then(|guard| guard.clone());
            if let Some(handle) = handle {
                if let Err(err) = handle.cancel(id) {
                    warn!(execution = %id, error = %err, "failed to remove execution from poll set");
                }
            }
        }

        self.finalize(
            &mut execution,
            ExecutionStatus::Canceled,
            serde_json::Value::Null,
            Some("canceled by request".to_string()),
        )
    }

    fn load(&self, id: ExecutionId) -> CascadeResult<LiveAction> {
        self.executions.get(id)?.ok_or_else(|| {
            CascadeError::Backend(BackendError::Storage {
                message: format!("execution not found: {id}"),
            })
        })
    }

    fn advance(&self, execution: &mut LiveAction, next: ExecutionStatus) -> CascadeResult<()> {
        execution
            .transition(next)
            .map_err(|e| CascadeError::internal(e.to_string()))?;
        self.executions.save(execution)?;
        self.publish_event(EventOp::Update, execution);
        Ok(())
    }

    fn finalize(
        &self,
        execution: &mut LiveAction,
        status: ExecutionStatus,
        result: serde_json::Value,
        cause: Option<String>,
    ) -> CascadeResult<()> {
        if let Err(e) = execution.transition(status) {
            // A completion racing a cancel can lose; the first terminal
            // status wins and later results are dropped.
            warn!(execution = %execution.id, error = %e, "dropping late status transition");
            return Ok(());
        }

        execution.result = result;
        execution.cause = cause.or_else(|| default_cause(status));
        self.executions.save(execution)?;
        self.publish_event(EventOp::Update, execution);
        info!(
            execution = %execution.id,
            status = %execution.status,
            cause = execution.cause.as_deref().unwrap_or(""),
            "execution reached terminal status"
        );

        self.invoke_callback(execution);
        Ok(())
    }

    fn invoke_callback(&self, execution: &LiveAction) {
        let Ok(callbacks) = self.callbacks.read() else {
            warn!("callback registry lock poisoned");
            return;
        };
        if let Some(callback) = callbacks.get(&execution.runner_type) {
            callback(execution);
        }
    }

    fn publish_event(&self, op: EventOp, execution: &LiveAction) {
        let body = match serde_json::to_value(execution) {
            Ok(body) => body,
            Err(e) => {
                warn!(execution = %execution.id, error = %e, "failed to serialize execution event");
                return;
            }
        };
        let key = routing_key("execution", op);
        if let Err(e) = self.bus.publish(TOPIC_EXECUTION, &key, body) {
            warn!(execution = %execution.id, error = %e, "failed to publish execution event");
        }
    }
}

impl std::fmt::Debug for ExecutionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLifecycleManager")
            .field("runners", &self.runners)
            .finish_non_exhaustive()
    }
}

fn default_cause(status: ExecutionStatus) -> Option<String> {
    match status {
        ExecutionStatus::Failed => Some("execution failed".to_string()),
        ExecutionStatus::TimedOut => Some("execution timed out".to_string()),
        ExecutionStatus::Abandoned => Some("execution abandoned".to_string()),
        _ => None,
    }
}
