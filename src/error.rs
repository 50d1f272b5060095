//! Error types for cascade.
//!
//! All errors are strongly typed using thiserror. The taxonomy separates
//! configuration problems (stable until an operator fixes them), transient
//! backend failures (retryable with backoff), sensor failures (isolated per
//! sensor), and criteria evaluation failures (isolated per rule).

use thiserror::Error;

/// Configuration errors.
///
/// These are fatal at the scope of the single rule, execution, or startup
/// step that hit them. Partition conflicts are fatal at process startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown criteria operator '{operator}'")]
    UnknownOperator {
        operator: String,
    },

    #[error("Operator '{operator}' requires a pattern for field '{field}'")]
    MissingCriterionPattern {
        operator: String,
        field: String,
    },

    #[error("Invalid criterion pattern for field '{field}': {reason}")]
    InvalidCriterionPattern {
        field: String,
        reason: String,
    },

    #[error("Trigger type '{trigger}' is not registered")]
    UnregisteredTriggerType {
        trigger: String,
    },

    #[error("Unknown runner type '{runner_type}'")]
    UnknownRunner {
        runner_type: String,
    },

    #[error("Unknown querier kind '{kind}'")]
    UnknownQuerier {
        kind: String,
    },

    #[error("Invalid parameters for action '{action}': {reason}")]
    InvalidRunnerParameters {
        action: String,
        reason: String,
    },

    #[error("Sensor '{sensor}' is assigned to both '{first}' and '{second}'")]
    DuplicateAssignment {
        sensor: String,
        first: String,
        second: String,
    },

    #[error("Sensor '{sensor}' is not assigned to any node")]
    UnassignedSensor {
        sensor: String,
    },

    #[error("Partition ordinal {ordinal} is out of range for fleet size {fleet_size}")]
    OrdinalOutOfRange {
        ordinal: u32,
        fleet_size: u32,
    },

    #[error("Invalid partition manifest: {reason}")]
    InvalidPartitionManifest {
        reason: String,
    },

    #[error("Required environment variable '{name}' is not set")]
    MissingEnvVar {
        name: String,
    },
}

/// Transient backend errors.
///
/// The store, transport, or a querier backend is temporarily unavailable.
/// Retried with bounded backoff; exhaustion surfaces as a terminal status
/// with the cause recorded.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
    },

    #[error("Querier backend '{kind}' failed: {message}")]
    QuerierBackend {
        kind: String,
        message: String,
    },

    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull {
        queue: String,
        capacity: usize,
    },

    #[error("Channel '{queue}' is disconnected")]
    Disconnected {
        queue: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Sensor failures.
///
/// Isolated per sensor: a failing sensor is restarted with backoff and never
/// affects other sensors or the dispatch pipeline.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Sensor '{sensor}' setup failed: {reason}")]
    SetupFailed {
        sensor: String,
        reason: String,
    },

    #[error("Sensor '{sensor}' run failed: {reason}")]
    RunFailed {
        sensor: String,
        reason: String,
    },

    #[error("Sensor '{sensor}' cleanup failed: {reason}")]
    CleanupFailed {
        sensor: String,
        reason: String,
    },

    #[error("Sensor '{sensor}' exhausted {attempts} restart attempts")]
    RestartsExhausted {
        sensor: String,
        attempts: u32,
    },
}

/// Criteria evaluation failures.
///
/// Malformed rule criteria skip only the offending rule; matching continues
/// for other rules against the same trigger instance.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Rule '{rule}' criterion '{field}' failed to evaluate: {reason}")]
    Criterion {
        rule: String,
        field: String,
        reason: String,
    },
}

/// Top-level error type for cascade.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Match evaluation error: {0}")]
    Match(#[from] MatchError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CascadeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a backend error.
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Returns true if this is a sensor error.
    #[must_use]
    pub const fn is_sensor(&self) -> bool {
        matches!(self, Self::Sensor(_))
    }

    /// Returns true if this is a match evaluation error.
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Match(_) | Self::Internal { .. } => false,
            Self::Backend(e) => !matches!(e, BackendError::Disconnected { .. }),
            Self::Sensor(e) => matches!(e, SensorError::RunFailed { .. }),
        }
    }
}

/// Result type alias for cascade operations.
pub type CascadeResult<T> = Result<T, CascadeError>;
