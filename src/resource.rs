//! Pack-scoped resource references.
//!
//! Trigger types, rules, actions, and sensors are all identified by a
//! `pack.name` pair. The pack groups related content; the name is unique
//! within the pack.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing a `pack.name` reference string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseRefError {
    /// The string had no `.` separator.
    #[error("resource reference '{0}' is missing a '.' separator")]
    MissingSeparator(String),

    /// The pack or name segment was empty.
    #[error("resource reference '{0}' has an empty segment")]
    EmptySegment(String),
}

/// A `pack.name` identity for a registered resource.
///
/// # Examples
///
/// ```
/// use cascade::ResourceRef;
///
/// let r: ResourceRef = "ops.on_deploy".parse().unwrap();
/// assert_eq!(r.pack(), "ops");
/// assert_eq!(r.name(), "on_deploy");
/// assert_eq!(r.to_string(), "ops.on_deploy");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pack: String,
    name: String,
}

impl ResourceRef {
    /// Creates a reference from pack and name segments.
    #[must_use]
    pub fn new(pack: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pack: pack.into(),
            name: name.into(),
        }
    }

    /// The pack segment.
    #[must_use]
    pub fn pack(&self) -> &str {
        &self.pack
    }

    /// The name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pack, self.name)
    }
}

impl FromStr for ResourceRef {
    type Err = ParseRefError;

    /// Parses `pack.name`. The name may itself contain dots; the split is on
    /// the first separator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pack, name) = s
            .split_once('.')
            .ok_or_else(|| ParseRefError::MissingSeparator(s.to_string()))?;
        if pack.trim().is_empty() || name.trim().is_empty() {
            return Err(ParseRefError::EmptySegment(s.to_string()));
        }
        Ok(Self::new(pack.trim(), name.trim()))
    }
}
