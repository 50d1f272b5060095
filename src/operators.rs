//! Criteria operators.
//!
//! Each operator is a pure function evaluating a single criterion against a
//! payload value. The registry is constructed explicitly and passed by
//! reference into the matcher; there are no module-level registries beyond
//! the bounded regex compile cache.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{CascadeError, CascadeResult, ConfigError};

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str, case_insensitive: bool) -> CascadeResult<regex::Regex> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    let key = if case_insensitive {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };

    {
        let guard = cache
            .read()
            .map_err(|_| CascadeError::internal("regex cache lock poisoned"))?;
        if let Some(re) = guard.get(&key) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| {
            CascadeError::Config(ConfigError::InvalidCriterionPattern {
                field: String::new(),
                reason: format!("invalid regex '{pattern}': {e}"),
            })
        })?;

    let mut guard = cache
        .write()
        .map_err(|_| CascadeError::internal("regex cache lock poisoned"))?;

    if guard.len() >= REGEX_CACHE_MAX {
        // Keep the cache bounded to avoid unbounded memory usage.
        guard.clear();
    }

    // Another thread may have inserted it while we compiled.
    guard.entry(key).or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// Resolves a dotted field path into a payload.
///
/// Object keys are matched literally; numeric segments index into arrays.
/// Returns `None` when any segment is absent.
#[must_use]
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// An operator: payload value (if the path resolved) and pattern in,
/// boolean verdict out.
pub type OperatorFn = fn(Option<&Value>, Option<&Value>) -> CascadeResult<bool>;

/// Named set of criteria operators.
///
/// Constructed once at startup and shared by reference.
pub struct OperatorRegistry {
    ops: HashMap<&'static str, OperatorFn>,
}

impl OperatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { ops: HashMap::new() }
    }

    /// Creates a registry with all built-in operators.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("equals", op_equals);
        r.register("nequals", op_nequals);
        r.register("contains", op_contains);
        r.register("ncontains", op_ncontains);
        r.register("startswith", op_startswith);
        r.register("endswith", op_endswith);
        r.register("regex", op_regex);
        r.register("iregex", op_iregex);
        r.register("lessthan", op_lessthan);
        r.register("greaterthan", op_greaterthan);
        r.register("exists", op_exists);
        r.register("nexists", op_nexists);
        r.register("timediff_lt", op_timediff_lt);
        r.register("timediff_gt", op_timediff_gt);
        r
    }

    /// Registers (or replaces) an operator.
    pub fn register(&mut self, name: &'static str, op: OperatorFn) {
        self.ops.insert(name, op);
    }

    /// Returns the registered operator names.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.keys().copied()
    }

    /// Evaluates one criterion.
    ///
    /// `value` is the payload value at the criterion's field path (absent if
    /// the path did not resolve); `pattern` is the criterion's pattern.
    pub fn evaluate(
        &self,
        operator: &str,
        value: Option<&Value>,
        pattern: Option<&Value>,
    ) -> CascadeResult<bool> {
        let op = self.ops.get(operator).ok_or_else(|| {
            CascadeError::Config(ConfigError::UnknownOperator {
                operator: operator.to_string(),
            })
        })?;
        op(value, pattern)
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.ops.len())
            .finish()
    }
}

fn require_pattern<'a>(operator: &str, pattern: Option<&'a Value>) -> CascadeResult<&'a Value> {
    pattern.ok_or_else(|| {
        CascadeError::Config(ConfigError::MissingCriterionPattern {
            operator: operator.to_string(),
            field: String::new(),
        })
    })
}

fn op_equals(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("equals", pattern)?;
    Ok(value.is_some_and(|v| json_eq(v, pattern)))
}

fn op_nequals(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("nequals", pattern)?;
    Ok(value.is_some_and(|v| !json_eq(v, pattern)))
}

// Numeric equality ignores the int/float representation split so that a
// criterion written as `5` matches a payload carrying `5.0`.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn op_contains(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("contains", pattern)?;
    let Some(value) = value else {
        return Ok(false);
    };
    Ok(contains_impl(value, pattern))
}

fn op_ncontains(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("ncontains", pattern)?;
    let Some(value) = value else {
        return Ok(false);
    };
    Ok(!contains_impl(value, pattern))
}

fn contains_impl(value: &Value, pattern: &Value) -> bool {
    match value {
        Value::String(s) => pattern.as_str().is_some_and(|p| s.contains(p)),
        Value::Array(items) => items.iter().any(|item| json_eq(item, pattern)),
        Value::Object(map) => pattern.as_str().is_some_and(|p| map.contains_key(p)),
        _ => false,
    }
}

fn op_startswith(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("startswith", pattern)?;
    Ok(match (value.and_then(Value::as_str), pattern.as_str()) {
        (Some(v), Some(p)) => v.starts_with(p),
        _ => false,
    })
}

fn op_endswith(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("endswith", pattern)?;
    Ok(match (value.and_then(Value::as_str), pattern.as_str()) {
        (Some(v), Some(p)) => v.ends_with(p),
        _ => false,
    })
}

fn op_regex(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    regex_impl(value, pattern, false)
}

fn op_iregex(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    regex_impl(value, pattern, true)
}

fn regex_impl(
    value: Option<&Value>,
    pattern: Option<&Value>,
    case_insensitive: bool,
) -> CascadeResult<bool> {
    let name = if case_insensitive { "iregex" } else { "regex" };
    let pattern = require_pattern(name, pattern)?;
    let Some(pattern) = pattern.as_str() else {
        return Err(CascadeError::Config(ConfigError::InvalidCriterionPattern {
            field: String::new(),
            reason: format!("{name} pattern must be a string"),
        }));
    };
    let re = cached_regex(pattern, case_insensitive)?;
    Ok(value.and_then(Value::as_str).is_some_and(|v| re.is_match(v)))
}

fn op_lessthan(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("lessthan", pattern)?;
    Ok(compare(value, pattern).is_some_and(std::cmp::Ordering::is_lt))
}

fn op_greaterthan(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("greaterthan", pattern)?;
    Ok(compare(value, pattern).is_some_and(std::cmp::Ordering::is_gt))
}

// Numbers compare numerically; strings compare lexicographically. Any other
// pairing never matches.
fn compare(value: Option<&Value>, pattern: &Value) -> Option<std::cmp::Ordering> {
    let value = value?;
    if let (Some(v), Some(p)) = (value.as_f64(), pattern.as_f64()) {
        return v.partial_cmp(&p);
    }
    if let (Some(v), Some(p)) = (value.as_str(), pattern.as_str()) {
        return Some(v.cmp(p));
    }
    None
}

fn op_exists(value: Option<&Value>, _pattern: Option<&Value>) -> CascadeResult<bool> {
    Ok(value.is_some())
}

fn op_nexists(value: Option<&Value>, _pattern: Option<&Value>) -> CascadeResult<bool> {
    Ok(value.is_none())
}

fn op_timediff_lt(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("timediff_lt", pattern)?;
    let (age, limit) = match timediff_parts(value, pattern)? {
        Some(parts) => parts,
        None => return Ok(false),
    };
    Ok(age < limit)
}

fn op_timediff_gt(value: Option<&Value>, pattern: Option<&Value>) -> CascadeResult<bool> {
    let pattern = require_pattern("timediff_gt", pattern)?;
    let (age, limit) = match timediff_parts(value, pattern)? {
        Some(parts) => parts,
        None => return Ok(false),
    };
    Ok(age > limit)
}

// Age of the payload timestamp in seconds, paired with the pattern limit.
fn timediff_parts(value: Option<&Value>, pattern: &Value) -> CascadeResult<Option<(f64, f64)>> {
    let Some(limit) = pattern.as_f64() else {
        return Err(CascadeError::Config(ConfigError::InvalidCriterionPattern {
            field: String::new(),
            reason: "timediff pattern must be a number of seconds".to_string(),
        }));
    };
    let Some(ts) = value.and_then(parse_timestamp) else {
        return Ok(None);
    };
    let age = (Utc::now() - ts).num_milliseconds() as f64 / 1000.0;
    Ok(Some((age, limit)))
}

// Accepts RFC 3339 strings and numeric epoch seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(op: &str, value: Option<Value>, pattern: Option<Value>) -> CascadeResult<bool> {
        let registry = OperatorRegistry::with_builtins();
        registry.evaluate(op, value.as_ref(), pattern.as_ref())
    }

    #[test]
    fn equals_matches_exact_values() {
        assert!(eval("equals", Some(json!("prod")), Some(json!("prod"))).unwrap());
        assert!(!eval("equals", Some(json!("staging")), Some(json!("prod"))).unwrap());
        assert!(eval("equals", Some(json!(5)), Some(json!(5.0))).unwrap());
        assert!(!eval("equals", None, Some(json!("prod"))).unwrap());
    }

    #[test]
    fn nequals_requires_present_value() {
        assert!(eval("nequals", Some(json!("staging")), Some(json!("prod"))).unwrap());
        // An absent field is not "not equal"; it simply does not match.
        assert!(!eval("nequals", None, Some(json!("prod"))).unwrap());
    }

    #[test]
    fn contains_covers_strings_arrays_objects() {
        assert!(eval("contains", Some(json!("production")), Some(json!("prod"))).unwrap());
        assert!(eval("contains", Some(json!(["a", "b"])), Some(json!("b"))).unwrap());
        assert!(eval("contains", Some(json!({"key": 1})), Some(json!("key"))).unwrap());
        assert!(!eval("contains", Some(json!(42)), Some(json!("4"))).unwrap());
        assert!(!eval("ncontains", Some(json!("production")), Some(json!("prod"))).unwrap());
        assert!(eval("ncontains", Some(json!("staging")), Some(json!("prod"))).unwrap());
    }

    #[test]
    fn prefix_suffix_operators() {
        assert!(eval("startswith", Some(json!("prod-eu")), Some(json!("prod"))).unwrap());
        assert!(!eval("startswith", Some(json!("eu-prod")), Some(json!("prod"))).unwrap());
        assert!(eval("endswith", Some(json!("eu-prod")), Some(json!("prod"))).unwrap());
    }

    #[test]
    fn regex_operators() {
        assert!(eval("regex", Some(json!("deploy-042")), Some(json!(r"^deploy-\d+$"))).unwrap());
        assert!(!eval("regex", Some(json!("DEPLOY-042")), Some(json!(r"^deploy-\d+$"))).unwrap());
        assert!(eval("iregex", Some(json!("DEPLOY-042")), Some(json!(r"^deploy-\d+$"))).unwrap());
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let err = eval("regex", Some(json!("x")), Some(json!("["))).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn comparisons() {
        assert!(eval("lessthan", Some(json!(3)), Some(json!(5))).unwrap());
        assert!(!eval("lessthan", Some(json!(5)), Some(json!(5))).unwrap());
        assert!(eval("greaterthan", Some(json!(7.5)), Some(json!(5))).unwrap());
        assert!(eval("lessthan", Some(json!("abc")), Some(json!("abd"))).unwrap());
        // Mixed types never match.
        assert!(!eval("greaterthan", Some(json!("7")), Some(json!(5))).unwrap());
    }

    #[test]
    fn existence_operators_ignore_pattern() {
        assert!(eval("exists", Some(json!(null)), None).unwrap());
        assert!(!eval("exists", None, None).unwrap());
        assert!(eval("nexists", None, None).unwrap());
        assert!(!eval("nexists", Some(json!(1)), None).unwrap());
    }

    #[test]
    fn timediff_operators() {
        let recent = Utc::now().to_rfc3339();
        assert!(eval("timediff_lt", Some(json!(recent)), Some(json!(3600))).unwrap());
        assert!(!eval("timediff_gt", Some(json!(Utc::now().to_rfc3339())), Some(json!(3600))).unwrap());

        let old_epoch = (Utc::now() - chrono::Duration::hours(2)).timestamp();
        assert!(eval("timediff_gt", Some(json!(old_epoch)), Some(json!(3600))).unwrap());

        // Unparseable timestamps never match.
        assert!(!eval("timediff_lt", Some(json!("not a time")), Some(json!(60))).unwrap());
    }

    #[test]
    fn timediff_pattern_must_be_numeric() {
        let err = eval("timediff_lt", Some(json!(0)), Some(json!("soon"))).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unknown_operator_is_a_config_error() {
        let err = eval("fuzzymatch", Some(json!(1)), Some(json!(1))).unwrap_err();
        assert!(err.is_config());
        assert!(format!("{err}").contains("fuzzymatch"));
    }

    #[test]
    fn missing_pattern_is_a_config_error() {
        let err = eval("equals", Some(json!(1)), None).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn lookup_path_resolves_nested_fields() {
        let payload = json!({
            "event": "deploy",
            "meta": {"env": "prod", "tags": ["eu", "canary"]},
        });
        assert_eq!(lookup_path(&payload, "event"), Some(&json!("deploy")));
        assert_eq!(lookup_path(&payload, "meta.env"), Some(&json!("prod")));
        assert_eq!(lookup_path(&payload, "meta.tags.1"), Some(&json!("canary")));
        assert_eq!(lookup_path(&payload, "meta.missing"), None);
        assert_eq!(lookup_path(&payload, "meta.tags.9"), None);
        assert_eq!(lookup_path(&payload, "event.deep"), None);
    }

    #[test]
    fn custom_operator_registration() {
        fn always(_: Option<&Value>, _: Option<&Value>) -> CascadeResult<bool> {
            Ok(true)
        }
        let mut registry = OperatorRegistry::with_builtins();
        registry.register("always", always);
        assert!(registry.evaluate("always", None, None).unwrap());
    }
}
