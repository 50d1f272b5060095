//! Querier subsystem for asynchronously-executed actions.
//!
//! Some runners hand work to an external system (e.g. a remote workflow
//! engine) and report a pending outcome. A querier is the backend-specific
//! poller that observes completion of those executions. The scheduler
//! multiplexes many outstanding executions over a bounded worker pool
//! instead of one task per execution.

/// Poll scheduling over a bounded worker pool.
pub mod scheduler;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CascadeError, CascadeResult, ConfigError};
use crate::execution::{ExecutionId, ExecutionStatus, QueryContext};

pub use scheduler::{PollerHandle, QuerierScheduler, QuerierSchedulerConfig};

/// Pacing knobs a querier declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerierTunables {
    /// Minimum gap between polls of the same execution.
    pub query_interval: Duration,

    /// Back-off when the work queue is empty.
    pub empty_q_sleep_time: Duration,

    /// Back-off when all workers are saturated.
    pub no_workers_sleep_time: Duration,
}

impl Default for QuerierTunables {
    fn default() -> Self {
        Self {
            query_interval: Duration::from_secs(5),
            empty_q_sleep_time: Duration::from_secs(1),
            no_workers_sleep_time: Duration::from_secs(1),
        }
    }
}

/// What one poll of a backend produced.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Execution status as observed on the backend.
    pub status: ExecutionStatus,

    /// Result payload, meaningful once the status is terminal.
    pub result: serde_json::Value,

    /// Human-readable cause for failed/timeout outcomes.
    pub cause: Option<String>,
}

impl QueryOutcome {
    /// The backend reports the execution still in progress.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            result: serde_json::Value::Null,
            cause: None,
        }
    }

    /// The backend reports successful completion.
    #[must_use]
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            result,
            cause: None,
        }
    }

    /// The backend reports failure.
    #[must_use]
    pub fn failed(result: serde_json::Value, cause: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result,
            cause: Some(cause.into()),
        }
    }
}

/// Backend-specific completion poller.
pub trait Querier: Send + Sync {
    /// The querier kind, matched against `QueryContext::querier`.
    fn kind(&self) -> &str;

    /// Polls the backend once for the given execution.
    fn query(
        &self,
        execution_id: ExecutionId,
        context: &QueryContext,
        last_query_time: Option<DateTime<Utc>>,
    ) -> CascadeResult<QueryOutcome>;

    /// Pacing declared by this querier.
    fn tunables(&self) -> QuerierTunables {
        QuerierTunables::default()
    }
}

/// Registry mapping querier kind to implementation, resolved once at
/// startup.
#[derive(Default)]
pub struct QuerierRegistry {
    queriers: HashMap<String, Arc<dyn Querier>>,
}

impl QuerierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a querier.
    pub fn register(&mut self, querier: Arc<dyn Querier>) {
        self.queriers.insert(querier.kind().to_string(), querier);
    }

    /// Looks up a querier by kind.
    pub fn get(&self, kind: &str) -> CascadeResult<Arc<dyn Querier>> {
        self.queriers.get(kind).cloned().ok_or_else(|| {
            CascadeError::Config(ConfigError::UnknownQuerier {
                kind: kind.to_string(),
            })
        })
    }
}

impl fmt::Debug for QuerierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerierRegistry")
            .field("kinds", &self.queriers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticQuerier;

    impl Querier for StaticQuerier {
        fn kind(&self) -> &str {
            "static"
        }

        fn query(
            &self,
            _execution_id: ExecutionId,
            _context: &QueryContext,
            _last_query_time: Option<DateTime<Utc>>,
        ) -> CascadeResult<QueryOutcome> {
            Ok(QueryOutcome::succeeded(json!({"done": true})))
        }
    }

    #[test]
    fn registry_resolves_by_kind() {
        let mut registry = QuerierRegistry::new();
        registry.register(Arc::new(StaticQuerier));

        let querier = registry.get("static").unwrap();
        let outcome = querier
            .query(
                ExecutionId::new(),
                &QueryContext::new("static", json!({})),
                None,
            )
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let registry = QuerierRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn default_tunables() {
        let t = QuerierTunables::default();
        assert_eq!(t.query_interval, Duration::from_secs(5));
        assert_eq!(t.empty_q_sleep_time, Duration::from_secs(1));
        assert_eq!(t.no_workers_sleep_time, Duration::from_secs(1));
    }
}
