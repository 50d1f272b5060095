//! Live action executions and their status lifecycle.
//!
//! A `LiveAction` tracks one invocation of an action through a monotonic
//! status machine. The lifecycle manager is the sole status writer while the
//! execution is in flight; once a terminal status is reached the record is
//! read-only.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::resource::ResourceRef;

/// Unique identifier for an action execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Creates a new random execution id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an action execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet scheduled.
    Requested,

    /// Being handed to a runner.
    Scheduling,

    /// Runner selected, about to start.
    Scheduled,

    /// Runner invoked; for async runners, completion is observed by a
    /// querier.
    Running,

    /// Terminal: completed successfully.
    Succeeded,

    /// Terminal: completed with failure.
    Failed,

    /// Terminal: exceeded its time budget.
    #[serde(rename = "timeout")]
    TimedOut,

    /// Cancel requested, awaiting acknowledgement.
    Canceling,

    /// Terminal: canceled and acknowledged.
    Canceled,

    /// Terminal: orphaned by a crashed owner.
    Abandoned,
}

impl ExecutionStatus {
    /// Returns true for statuses that accept no further transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Canceled | Self::Abandoned
        )
    }

    /// Returns true if `next` is a legal transition from `self`.
    ///
    /// Transitions are monotonic: terminal states accept nothing, and the
    /// machine never moves backwards through the scheduling phases.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Requested => matches!(
                next,
                Self::Scheduling | Self::Scheduled | Self::Failed | Self::Canceling | Self::Abandoned
            ),
            Self::Scheduling => matches!(
                next,
                Self::Scheduled | Self::Failed | Self::Canceling | Self::Abandoned
            ),
            Self::Scheduled => matches!(
                next,
                Self::Running | Self::Failed | Self::TimedOut | Self::Canceling | Self::Abandoned
            ),
            Self::Running => matches!(
                next,
                Self::Succeeded
                    | Self::Failed
                    | Self::TimedOut
                    | Self::Canceling
                    | Self::Abandoned
            ),
            Self::Canceling => matches!(next, Self::Canceled | Self::Failed | Self::Abandoned),
            Self::Succeeded
            | Self::Failed
            | Self::TimedOut
            | Self::Canceled
            | Self::Abandoned => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Scheduling => "scheduling",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// Rejected status transition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal execution status transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// Current status.
    pub from: ExecutionStatus,
    /// Rejected target status.
    pub to: ExecutionStatus,
}

/// Opaque per-execution state a querier needs to resume polling.
///
/// Attached to the execution when a runner reports a pending outcome;
/// ownership moves to the querier scheduler at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// The querier kind that owns this context.
    pub querier: String,

    /// Backend-specific resume state (e.g. a remote job id).
    pub context: serde_json::Value,
}

impl QueryContext {
    /// Creates a context for the given querier kind.
    #[must_use]
    pub fn new(querier: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            querier: querier.into(),
            context,
        }
    }
}

/// One invocation of an action, tracked through the status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveAction {
    /// Unique id.
    pub id: ExecutionId,

    /// The invoked action's `pack.name`.
    pub action: ResourceRef,

    /// Which runner kind executes this action.
    pub runner_type: String,

    /// Input parameters.
    pub parameters: serde_json::Value,

    /// Current status.
    pub status: ExecutionStatus,

    /// Runner/querier result payload.
    #[serde(default)]
    pub result: serde_json::Value,

    /// Human-readable cause carried by terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    /// When the execution was requested.
    pub requested_at: DateTime<Utc>,

    /// When a terminal status was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Polling state for async runners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_context: Option<QueryContext>,
}

impl LiveAction {
    /// Creates a `Requested` execution.
    #[must_use]
    pub fn new(action: ResourceRef, runner_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            id: ExecutionId::new(),
            action,
            runner_type: runner_type.into(),
            parameters,
            status: ExecutionStatus::Requested,
            result: serde_json::Value::Null,
            cause: None,
            requested_at: Utc::now(),
            ended_at: None,
            query_context: None,
        }
    }

    /// Moves the execution to `next`, stamping `ended_at` on terminal
    /// states. Rejects regressions and transitions out of terminal states.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}
