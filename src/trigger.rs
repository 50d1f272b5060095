//! Trigger types and trigger instances.
//!
//! A `TriggerType` is the registered schema/identity for a class of external
//! event. A `TriggerInstance` is one occurrence of such an event, created by
//! the dispatcher on every sensor emission and retained for audit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::ResourceRef;

/// Unique identifier for a trigger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerInstanceId(Uuid);

impl TriggerInstanceId {
    /// Creates a new random trigger instance id.
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

impl Default for TriggerInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered schema and identity for a class of external event.
///
/// Immutable once registered; redefinition requires an explicit store
/// update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerType {
    /// The `pack.name` identity.
    #[serde(rename = "ref")]
    pub reference: ResourceRef,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema for instance payloads.
    #[serde(default)]
    pub payload_schema: serde_json::Value,

    /// JSON schema for registration parameters (programmable sensors).
    #[serde(default)]
    pub parameters_schema: serde_json::Value,
}

impl TriggerType {
    /// Creates a trigger type with empty schemas.
    #[must_use]
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            description: None,
            payload_schema: serde_json::Value::Null,
            parameters_schema: serde_json::Value::Null,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the payload schema.
    #[must_use]
    pub fn with_payload_schema(mut self, schema: serde_json::Value) -> Self {
        self.payload_schema = schema;
        self
    }
}

/// Processing status of a trigger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerInstanceStatus {
    /// Created, not yet run through rule matching.
    Pending,

    /// Rule matching completed (individual enforcement failures included).
    Processed,

    /// Rule matching itself failed (e.g. store unavailable).
    ProcessingFailed,
}

impl Default for TriggerInstanceStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TriggerInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::ProcessingFailed => "processing_failed",
        };
        write!(f, "{s}")
    }
}

/// One occurrence of an external event, with payload.
///
/// Created on every sensor emission. Only the status (and status message)
/// mutates after creation; instances are retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInstance {
    /// Unique id.
    pub id: TriggerInstanceId,

    /// The trigger type this instance occurred for.
    pub trigger: ResourceRef,

    /// Opaque structured event payload.
    pub payload: serde_json::Value,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Processing status.
    pub status: TriggerInstanceStatus,

    /// Detail for `ProcessingFailed`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl TriggerInstance {
    /// Creates a pending instance.
    #[must_use]
    pub fn new(trigger: ResourceRef, payload: serde_json::Value, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: TriggerInstanceId::new(),
            trigger,
            payload,
            occurred_at,
            status: TriggerInstanceStatus::Pending,
            status_message: None,
        }
    }

    /// Marks the instance processed.
    pub fn mark_processed(&mut self) {
        self.status = TriggerInstanceStatus::Processed;
        self.status_message = None;
    }

    /// Marks the instance failed with a cause message.
    pub fn mark_processing_failed(&mut self, message: impl Into<String>) {
        self.status = TriggerInstanceStatus::ProcessingFailed;
        self.status_message = Some(message.into());
    }
}
