//! Fleet partition assignment.
//!
//! Decides which sensors this process is responsible for. For a fixed
//! policy and fleet topology the assignment is deterministic, and every
//! sensor belongs to exactly one process; a duplicate or missing assignment
//! is a fatal startup condition, never silently tolerated.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CascadeResult, ConfigError};
use crate::resource::ResourceRef;
use crate::sensor::SensorSpec;

/// External assignment source for the `kvstore` policy.
///
/// The lookup performs an external read against a shared coordination
/// store; how and when the store rebalances is the store's business. The
/// caller re-runs `assign` on its configured refresh cadence.
pub trait PartitionLookup: Send + Sync + fmt::Debug {
    /// Sensors assigned to `node_id`.
    fn sensors_for(&self, node_id: &str) -> CascadeResult<Vec<ResourceRef>>;
}

/// Which sensors this process runs.
#[derive(Debug, Clone)]
pub enum PartitionPolicy {
    /// Single-process mode: every sensor runs locally.
    Default,

    /// Static assignment from a JSON manifest keyed by node id.
    File {
        /// Manifest path.
        path: PathBuf,
        /// This process's node id.
        node_id: String,
    },

    /// Deterministic hash of the sensor partition key modulo fleet size.
    Hash {
        /// This process's ordinal in the fleet, `0..fleet_size`.
        ordinal: u32,
        /// Total number of supervisor processes.
        fleet_size: u32,
    },

    /// Assignment read from a shared coordination store.
    KvStore {
        /// This process's node id.
        node_id: String,
        /// The external lookup.
        lookup: Arc<dyn PartitionLookup>,
        /// How often the caller should re-run assignment.
        refresh_interval: Duration,
    },
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self::Default
    }
}

/// Stable bucket for a partition key: first eight bytes of the blake3
/// digest modulo the fleet size.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hash_partition(key: &str, fleet_size: u32) -> u32 {
    let digest = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(bytes) % u64::from(fleet_size)) as u32
}

impl PartitionPolicy {
    /// Returns the subset of `all` this process is responsible for.
    pub fn assign(&self, all: &[SensorSpec]) -> CascadeResult<Vec<SensorSpec>> {
        match self {
            Self::Default => Ok(all.to_vec()),
            Self::Hash {
                ordinal,
                fleet_size,
            } => assign_hash(all, *ordinal, *fleet_size),
            Self::File { path, node_id } => assign_file(all, path, node_id),
            Self::KvStore {
                node_id, lookup, ..
            } => assign_lookup(all, node_id, lookup.as_ref()),
        }
    }
}

fn assign_hash(all: &[SensorSpec], ordinal: u32, fleet_size: u32) -> CascadeResult<Vec<SensorSpec>> {
    if fleet_size == 0 || ordinal >= fleet_size {
        return Err(ConfigError::OrdinalOutOfRange {
            ordinal,
            fleet_size,
        }
        .into());
    }
    Ok(all
        .iter()
        .filter(|spec| hash_partition(&spec.partition_key(), fleet_size) == ordinal)
        .cloned()
        .collect())
}

fn assign_file(all: &[SensorSpec], path: &PathBuf, node_id: &str) -> CascadeResult<Vec<SensorSpec>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidPartitionManifest {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;
    let manifest: HashMap<String, Vec<String>> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidPartitionManifest {
            reason: format!("cannot parse '{}': {e}", path.display()),
        })?;

    let known: HashSet<String> = all.iter().map(|spec| spec.reference.to_string()).collect();

    // Validate the whole manifest, not just our slice: a duplicate or
    // orphan anywhere in the fleet is a startup error everywhere.
    let mut owner_of: HashMap<String, String> = HashMap::new();
    for (node, refs) in &manifest {
        for raw_ref in refs {
            let reference = ResourceRef::from_str(raw_ref).map_err(|e| {
                ConfigError::InvalidPartitionManifest {
                    reason: e.to_string(),
                }
            })?;
            let key = reference.to_string();
            if !known.contains(&key) {
                return Err(ConfigError::InvalidPartitionManifest {
                    reason: format!("manifest references unknown sensor '{key}'"),
                }
                .into());
            }
            if let Some(first) = owner_of.insert(key.clone(), node.clone()) {
                return Err(ConfigError::DuplicateAssignment {
                    sensor: key,
                    first,
                    second: node.clone(),
                }
                .into());
            }
        }
    }

    for spec in all {
        let key = spec.reference.to_string();
        if !owner_of.contains_key(&key) {
            return Err(ConfigError::UnassignedSensor { sensor: key }.into());
        }
    }

    Ok(all
        .iter()
        .filter(|spec| {
            owner_of
                .get(&spec.reference.to_string())
                .is_some_and(|owner| owner == node_id)
        })
        .cloned()
        .collect())
}

fn assign_lookup(
    all: &[SensorSpec],
    node_id: &str,
    lookup: &dyn PartitionLookup,
) -> CascadeResult<Vec<SensorSpec>> {
    let assigned = lookup.sensors_for(node_id)?;
    let mut out = Vec::with_capacity(assigned.len());
    for reference in assigned {
        let Some(spec) = all.iter().find(|spec| spec.reference == reference) else {
            return Err(ConfigError::InvalidPartitionManifest {
                reason: format!("assignment references unknown sensor '{reference}'"),
            }
            .into());
        };
        out.push(spec.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn specs(names: &[&str]) -> Vec<SensorSpec> {
        names
            .iter()
            .map(|n| SensorSpec::new(ResourceRef::new("pack", *n)))
            .collect()
    }

    fn refs(specs: &[SensorSpec]) -> Vec<String> {
        let mut out: Vec<String> = specs.iter().map(|s| s.reference.to_string()).collect();
        out.sort();
        out
    }

    #[test]
    fn default_policy_runs_everything_locally() {
        let all = specs(&["a", "b", "c"]);
        let assigned = PartitionPolicy::Default.assign(&all).unwrap();
        assert_eq!(refs(&assigned), refs(&all));
    }

    #[test]
    fn hash_policy_partitions_without_overlap_or_orphans() {
        let names: Vec<String> = (0..40).map(|i| format!("sensor_{i}")).collect();
        let all: Vec<SensorSpec> = names
            .iter()
            .map(|n| SensorSpec::new(ResourceRef::new("pack", n.clone())))
            .collect();
        let fleet_size = 3;

        let mut seen: Vec<String> = Vec::new();
        for ordinal in 0..fleet_size {
            let policy = PartitionPolicy::Hash {
                ordinal,
                fleet_size,
            };
            let assigned = policy.assign(&all).unwrap();
            for spec in &assigned {
                let key = spec.reference.to_string();
                assert!(!seen.contains(&key), "sensor '{key}' assigned twice");
                seen.push(key);
            }
        }
        assert_eq!(seen.len(), all.len());
    }

    #[test]
    fn hash_policy_is_deterministic() {
        let all = specs(&["a", "b", "c", "d", "e"]);
        let policy = PartitionPolicy::Hash {
            ordinal: 1,
            fleet_size: 2,
        };
        assert_eq!(refs(&policy.assign(&all).unwrap()), refs(&policy.assign(&all).unwrap()));
    }

    #[test]
    fn hash_policy_respects_custom_partition_key() {
        let pinned = SensorSpec::new(ResourceRef::new("pack", "pinned")).with_partition_key("shared-key");
        let bucket = hash_partition("shared-key", 4);
        let policy = PartitionPolicy::Hash {
            ordinal: bucket,
            fleet_size: 4,
        };
        let assigned = policy.assign(std::slice::from_ref(&pinned)).unwrap();
        assert_eq!(assigned.len(), 1);
    }

    #[test]
    fn hash_policy_rejects_bad_ordinal() {
        let all = specs(&["a"]);
        let err = PartitionPolicy::Hash {
            ordinal: 3,
            fleet_size: 3,
        }
        .assign(&all)
        .unwrap_err();
        assert!(err.is_config());

        let err = PartitionPolicy::Hash {
            ordinal: 0,
            fleet_size: 0,
        }
        .assign(&all)
        .unwrap_err();
        assert!(err.is_config());
    }

    fn write_manifest(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_policy_returns_this_nodes_slice() {
        let all = specs(&["a", "b", "c"]);
        let manifest = write_manifest(
            r#"{"node-0": ["pack.a", "pack.c"], "node-1": ["pack.b"]}"#,
        );

        let policy = PartitionPolicy::File {
            path: manifest.path().to_path_buf(),
            node_id: "node-0".to_string(),
        };
        let assigned = policy.assign(&all).unwrap();
        assert_eq!(refs(&assigned), vec!["pack.a".to_string(), "pack.c".to_string()]);
    }

    #[test]
    fn file_policy_detects_duplicate_assignment() {
        let all = specs(&["a", "b"]);
        let manifest = write_manifest(
            r#"{"node-0": ["pack.a", "pack.b"], "node-1": ["pack.a"]}"#,
        );

        let err = PartitionPolicy::File {
            path: manifest.path().to_path_buf(),
            node_id: "node-0".to_string(),
        }
        .assign(&all)
        .unwrap_err();
        assert!(err.is_config());
        assert!(format!("{err}").contains("pack.a"));
    }

    #[test]
    fn file_policy_detects_orphaned_sensor() {
        let all = specs(&["a", "b"]);
        let manifest = write_manifest(r#"{"node-0": ["pack.a"]}"#);

        let err = PartitionPolicy::File {
            path: manifest.path().to_path_buf(),
            node_id: "node-0".to_string(),
        }
        .assign(&all)
        .unwrap_err();
        assert!(format!("{err}").contains("pack.b"));
    }

    #[test]
    fn file_policy_rejects_unknown_sensor_refs() {
        let all = specs(&["a"]);
        let manifest = write_manifest(r#"{"node-0": ["pack.a", "pack.ghost"]}"#);

        let err = PartitionPolicy::File {
            path: manifest.path().to_path_buf(),
            node_id: "node-0".to_string(),
        }
        .assign(&all)
        .unwrap_err();
        assert!(format!("{err}").contains("pack.ghost"));
    }

    #[test]
    fn file_policy_rejects_unreadable_manifest() {
        let all = specs(&["a"]);
        let err = PartitionPolicy::File {
            path: PathBuf::from("/nonexistent/manifest.json"),
            node_id: "node-0".to_string(),
        }
        .assign(&all)
        .unwrap_err();
        assert!(err.is_config());
    }

    #[derive(Debug)]
    struct StaticLookup {
        assignments: HashMap<String, Vec<ResourceRef>>,
    }

    impl PartitionLookup for StaticLookup {
        fn sensors_for(&self, node_id: &str) -> CascadeResult<Vec<ResourceRef>> {
            Ok(self.assignments.get(node_id).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn kvstore_policy_uses_external_lookup() {
        let all = specs(&["a", "b"]);
        let mut assignments = HashMap::new();
        assignments.insert(
            "node-7".to_string(),
            vec![ResourceRef::new("pack", "b")],
        );

        let policy = PartitionPolicy::KvStore {
            node_id: "node-7".to_string(),
            lookup: Arc::new(StaticLookup { assignments }),
            refresh_interval: Duration::from_secs(60),
        };
        let assigned = policy.assign(&all).unwrap();
        assert_eq!(refs(&assigned), vec!["pack.b".to_string()]);
    }

    #[test]
    fn kvstore_policy_rejects_unknown_sensor() {
        let all = specs(&["a"]);
        let mut assignments = HashMap::new();
        assignments.insert(
            "node-7".to_string(),
            vec![ResourceRef::new("pack", "ghost")],
        );

        let err = PartitionPolicy::KvStore {
            node_id: "node-7".to_string(),
            lookup: Arc::new(StaticLookup { assignments }),
            refresh_interval: Duration::from_secs(60),
        }
        .assign(&all)
        .unwrap_err();
        assert!(err.is_config());
    }
}
