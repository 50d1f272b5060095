//! Runner plugin contract.
//!
//! A runner executes one action invocation. Some runner kinds produce their
//! result synchronously; others hand the work to an external system and
//! report a pending outcome carrying the query context a querier needs to
//! observe completion.

use std::collections::HashMap;
use std::fmt;

use crate::error::{CascadeError, CascadeResult, ConfigError};
use crate::execution::{ExecutionStatus, QueryContext};

/// Outcome status reported by a runner's `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Finished successfully.
    Succeeded,

    /// Finished with failure.
    Failed,

    /// Exceeded its time budget.
    TimedOut,

    /// Handed off to an external system; completion is observed by a
    /// querier using the attached query context.
    Pending,
}

impl RunStatus {
    /// Maps a finished run status onto the execution status machine.
    /// `Pending` has no terminal mapping; the execution stays `Running`.
    #[must_use]
    pub const fn as_execution_status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::Succeeded => Some(ExecutionStatus::Succeeded),
            Self::Failed => Some(ExecutionStatus::Failed),
            Self::TimedOut => Some(ExecutionStatus::TimedOut),
            Self::Pending => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
            Self::Pending => "pending",
        };
        write!(f, "{s}")
    }
}

/// What a runner's `run` produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Outcome status.
    pub status: RunStatus,

    /// Result payload.
    pub result: serde_json::Value,

    /// Human-readable cause for failed/timeout outcomes.
    pub cause: Option<String>,

    /// Present iff `status` is `Pending`.
    pub query_context: Option<QueryContext>,
}

impl RunOutcome {
    /// A successful synchronous outcome.
    #[must_use]
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            status: RunStatus::Succeeded,
            result,
            cause: None,
            query_context: None,
        }
    }

    /// A failed synchronous outcome.
    #[must_use]
    pub fn failed(result: serde_json::Value, cause: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            result,
            cause: Some(cause.into()),
            query_context: None,
        }
    }

    /// A pending outcome to be observed by a querier.
    #[must_use]
    pub fn pending(query_context: QueryContext) -> Self {
        Self {
            status: RunStatus::Pending,
            result: serde_json::Value::Null,
            cause: None,
            query_context: Some(query_context),
        }
    }
}

/// One action invocation's executor.
///
/// `pre_run` validates parameters and resource availability, `run` performs
/// the invocation, `post_run` cleans up local resources. The lifecycle
/// manager drives all three in order on the same instance.
pub trait Runner: Send {
    /// The runner kind, e.g. `http`, `workflow_engine`.
    fn run_type(&self) -> &str;

    /// Validates parameters before the run. A failure here is a
    /// configuration error scoped to the single execution.
    fn pre_run(&mut self, parameters: &serde_json::Value) -> CascadeResult<()>;

    /// Invokes the action.
    fn run(&mut self, parameters: serde_json::Value) -> CascadeResult<RunOutcome>;

    /// Releases local resources. Runs after the synchronous phase,
    /// regardless of outcome.
    fn post_run(&mut self) {}
}

/// Factory producing a fresh runner per execution.
pub type RunnerFactory = Box<dyn Fn() -> Box<dyn Runner> + Send + Sync>;

/// Registry mapping runner kind to factory, resolved once at startup.
#[derive(Default)]
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a runner kind.
    pub fn register(&mut self, runner_type: impl Into<String>, factory: RunnerFactory) {
        self.factories.insert(runner_type.into(), factory);
    }

    /// Returns true if the kind is registered.
    #[must_use]
    pub fn contains(&self, runner_type: &str) -> bool {
        self.factories.contains_key(runner_type)
    }

    /// Builds a fresh runner for the kind.
    pub fn build(&self, runner_type: &str) -> CascadeResult<Box<dyn Runner>> {
        let factory = self.factories.get(runner_type).ok_or_else(|| {
            CascadeError::Config(ConfigError::UnknownRunner {
                runner_type: runner_type.to_string(),
            })
        })?;
        Ok(factory())
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("kinds", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoRunner;

    impl Runner for EchoRunner {
        fn run_type(&self) -> &str {
            "echo"
        }

        fn pre_run(&mut self, parameters: &serde_json::Value) -> CascadeResult<()> {
            if parameters.is_object() {
                Ok(())
            } else {
                Err(CascadeError::Config(ConfigError::InvalidRunnerParameters {
                    action: "test.echo".to_string(),
                    reason: "parameters must be an object".to_string(),
                }))
            }
        }

        fn run(&mut self, parameters: serde_json::Value) -> CascadeResult<RunOutcome> {
            Ok(RunOutcome::succeeded(parameters))
        }
    }

    #[test]
    fn registry_builds_registered_kinds() {
        let mut registry = RunnerRegistry::new();
        registry.register("echo", Box::new(|| Box::new(EchoRunner)));

        assert!(registry.contains("echo"));
        let mut runner = registry.build("echo").unwrap();
        assert_eq!(runner.run_type(), "echo");

        runner.pre_run(&json!({})).unwrap();
        let outcome = runner.run(json!({"k": "v"})).unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.result, json!({"k": "v"}));
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let registry = RunnerRegistry::new();
        let err = registry.build("missing").err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn pre_run_rejects_bad_parameters() {
        let mut runner = EchoRunner;
        let err = runner.pre_run(&json!("not an object")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn run_status_maps_to_execution_status() {
        assert_eq!(
            RunStatus::Succeeded.as_execution_status(),
            Some(ExecutionStatus::Succeeded)
        );
        assert_eq!(
            RunStatus::TimedOut.as_execution_status(),
            Some(ExecutionStatus::TimedOut)
        );
        assert_eq!(RunStatus::Pending.as_execution_status(), None);
    }

    #[test]
    fn pending_outcome_carries_context() {
        let outcome = RunOutcome::pending(QueryContext::new("workflow_engine", json!({"job": 1})));
        assert_eq!(outcome.status, RunStatus::Pending);
        assert_eq!(outcome.query_context.as_ref().unwrap().querier, "workflow_engine");
    }
}
