//! Rule matching against trigger instances.
//!
//! A rule matches an instance iff its trigger type equals the instance's
//! and every criterion in its criteria map evaluates true (logical AND).
//! There is no OR/grouping; that would slot in here as a criteria-tree
//! evaluator without touching dispatch.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CascadeError, CascadeResult, MatchError};
use crate::operators::{lookup_path, OperatorRegistry};
use crate::rule::Rule;
use crate::trigger::TriggerInstance;

/// Evaluates rule criteria using a shared operator registry.
#[derive(Debug)]
pub struct RuleMatcher {
    operators: Arc<OperatorRegistry>,
}

impl RuleMatcher {
    /// Creates a matcher over the given operator registry.
    #[must_use]
    pub fn new(operators: Arc<OperatorRegistry>) -> Self {
        Self { operators }
    }

    /// Returns the subset of `rules` matching `instance`.
    ///
    /// Disabled rules and rules for other trigger types are ignored. A rule
    /// whose criteria fail to evaluate (unknown operator, missing or
    /// malformed pattern) is skipped and logged; it never aborts matching
    /// of the remaining rules. No rule consumes the instance: fan-out to
    /// many rules is expected.
    #[must_use]
    pub fn matching_rules(&self, instance: &TriggerInstance, rules: &[Rule]) -> Vec<Rule> {
        let mut matched = Vec::new();
        for rule in rules {
            if !rule.enabled || rule.trigger != instance.trigger {
                continue;
            }
            match self.rule_matches(rule, instance) {
                Ok(true) => matched.push(rule.clone()),
                Ok(false) => {}
                Err(err) => {
                    warn!(rule = %rule.reference, error = %err, "skipping rule with unevaluable criteria");
                }
            }
        }
        debug!(
            trigger_instance = %instance.id,
            trigger = %instance.trigger,
            candidates = rules.len(),
            matched = matched.len(),
            "rule matching finished"
        );
        matched
    }

    /// Evaluates all criteria of one rule against the instance payload.
    pub fn rule_matches(&self, rule: &Rule, instance: &TriggerInstance) -> CascadeResult<bool> {
        for (field, criterion) in &rule.criteria {
            let value = lookup_path(&instance.payload, field);
            let verdict = self
                .operators
                .evaluate(&criterion.operator, value, criterion.pattern.as_ref())
                .map_err(|err| {
                    CascadeError::Match(MatchError::Criterion {
                        rule: rule.reference.to_string(),
                        field: field.clone(),
                        reason: err.to_string(),
                    })
                })?;
            if !verdict {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use serde_json::json;

    use crate::resource::ResourceRef;
    use crate::rule::{ActionBinding, Criterion};

    fn matcher() -> RuleMatcher {
        RuleMatcher::new(Arc::new(OperatorRegistry::with_builtins()))
    }

    fn deploy_instance(env: &str) -> TriggerInstance {
        TriggerInstance::new(
            ResourceRef::new("ops", "deploy_event"),
            json!({"event": "deploy", "env": env}),
            Utc::now(),
        )
    }

    fn rule_on_env(name: &str, env: &str) -> Rule {
        Rule::new(
            ResourceRef::new("ops", name),
            ResourceRef::new("ops", "deploy_event"),
            ActionBinding::new(ResourceRef::new("ops", "notify"), "http", json!({})),
        )
        .with_criterion("env", Criterion::new("equals", json!(env)))
    }

    #[test]
    fn all_criteria_must_hold() {
        let m = matcher();
        let rule = rule_on_env("on_prod", "prod")
            .with_criterion("event", Criterion::new("equals", json!("deploy")));

        assert!(m.rule_matches(&rule, &deploy_instance("prod")).unwrap());
        assert!(!m.rule_matches(&rule, &deploy_instance("staging")).unwrap());
    }

    #[test]
    fn matching_returns_all_qualifying_rules() {
        let m = matcher();
        let rules = vec![
            rule_on_env("on_prod", "prod"),
            rule_on_env("on_staging", "staging"),
            rule_on_env("on_prod_too", "prod"),
        ];

        let matched = m.matching_rules(&deploy_instance("prod"), &rules);
        let names: Vec<&str> = matched.iter().map(|r| r.reference.name()).collect();
        assert_eq!(names, vec!["on_prod", "on_prod_too"]);
    }

    #[test]
    fn rule_without_criteria_always_matches() {
        let m = matcher();
        let rule = Rule::new(
            ResourceRef::new("ops", "catch_all"),
            ResourceRef::new("ops", "deploy_event"),
            ActionBinding::new(ResourceRef::new("ops", "notify"), "http", json!({})),
        );
        assert_eq!(m.matching_rules(&deploy_instance("prod"), &[rule]).len(), 1);
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let m = matcher();
        let rule = rule_on_env("on_prod", "prod").with_enabled(false);
        assert!(m.matching_rules(&deploy_instance("prod"), &[rule]).is_empty());
    }

    #[test]
    fn other_trigger_types_are_ignored() {
        let m = matcher();
        let mut rule = rule_on_env("on_prod", "prod");
        rule.trigger = ResourceRef::new("ops", "alert_event");
        assert!(m.matching_rules(&deploy_instance("prod"), &[rule]).is_empty());
    }

    #[test]
    fn bad_criteria_skip_only_that_rule() {
        let m = matcher();
        let broken = rule_on_env("broken", "prod")
            .with_criterion("env", Criterion::new("fuzzymatch", json!("prod")));
        let fine = rule_on_env("fine", "prod");

        let matched = m.matching_rules(&deploy_instance("prod"), &[broken, fine]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].reference.name(), "fine");
    }

    #[test]
    fn missing_pattern_is_an_evaluation_error() {
        let m = matcher();
        let rule = rule_on_env("on_prod", "prod")
            .with_criterion("env", Criterion::without_pattern("equals"));
        let err = m.rule_matches(&rule, &deploy_instance("prod")).unwrap_err();
        assert!(err.is_match());
        assert!(format!("{err}").contains("ops.on_prod"));
    }

    #[test]
    fn nested_field_paths_resolve() {
        let m = matcher();
        let instance = TriggerInstance::new(
            ResourceRef::new("ops", "deploy_event"),
            json!({"meta": {"env": "prod"}}),
            Utc::now(),
        );
        let rule = Rule::new(
            ResourceRef::new("ops", "nested"),
            ResourceRef::new("ops", "deploy_event"),
            ActionBinding::new(ResourceRef::new("ops", "notify"), "http", json!({})),
        )
        .with_criterion("meta.env", Criterion::new("equals", json!("prod")));

        assert!(m.rule_matches(&rule, &instance).unwrap());
    }
}
