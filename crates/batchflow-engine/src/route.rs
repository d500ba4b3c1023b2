//! Route branch evaluation for ROUTE steps.
//!
//! Branches are evaluated in declaration order and the first branch whose
//! full condition list holds wins — no fallthrough even if later branches
//! would also match. Unmatched records fall to the default branch, or are
//! dropped when none is declared. Evaluation is deterministic: the only
//! state is a compiled-regex cache.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use serde_json::Value;

use batchflow_types::definition::{Comparator, RouteCondition, RouteConfig};
use batchflow_types::record::{field_path, Record};

/// Where a record goes after route evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Matched a declared branch.
    Branch(String),
    /// No branch matched; routed to the default branch.
    Default(String),
    /// No branch matched and no default is declared.
    Dropped,
}

impl RouteOutcome {
    /// Branch name to feed successors with, if the record survives.
    #[must_use]
    pub fn branch_name(&self) -> Option<&str> {
        match self {
            Self::Branch(name) | Self::Default(name) => Some(name),
            Self::Dropped => None,
        }
    }
}

/// Evaluates [`RouteConfig`]s against records.
#[derive(Default)]
pub struct RouteEvaluator {
    regex_cache: Mutex<HashMap<String, Regex>>,
}

impl RouteEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the branch for one record. First match wins, in order.
    #[must_use]
    pub fn evaluate(&self, route: &RouteConfig, record: &Record) -> RouteOutcome {
        for branch in &route.branches {
            if branch
                .when
                .iter()
                .all(|cond| self.condition_matches(cond, record))
            {
                return RouteOutcome::Branch(branch.name.clone());
            }
        }
        match &route.default_branch {
            Some(default) => RouteOutcome::Default(default.clone()),
            None => RouteOutcome::Dropped,
        }
    }

    /// Evaluate a single condition. Type mismatches never panic — a
    /// comparator applied to an incompatible value is simply false.
    #[must_use]
    pub fn condition_matches(&self, cond: &RouteCondition, record: &Record) -> bool {
        let field = field_path(record, &cond.field);
        match cond.cmp {
            Comparator::Exists => return field.is_some(),
            // A missing field is null-ish.
            Comparator::IsNull => return field.is_none_or(Value::is_null),
            _ => {}
        }
        let Some(value) = field else {
            return false;
        };

        match cond.cmp {
            Comparator::Eq => loose_eq(value, &cond.value),
            Comparator::Ne => !loose_eq(value, &cond.value),
            Comparator::Gt => compare(value, &cond.value).is_some_and(|o| o.is_gt()),
            Comparator::Lt => compare(value, &cond.value).is_some_and(|o| o.is_lt()),
            Comparator::Gte => compare(value, &cond.value).is_some_and(|o| o.is_ge()),
            Comparator::Lte => compare(value, &cond.value).is_some_and(|o| o.is_le()),
            Comparator::In => cond
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| loose_eq(value, item))),
            Comparator::NotIn => cond
                .value
                .as_array()
                .is_some_and(|items| !items.iter().any(|item| loose_eq(value, item))),
            Comparator::Contains => contains(value, &cond.value),
            Comparator::NotContains => !contains(value, &cond.value),
            Comparator::StartsWith => str_pair(value, &cond.value)
                .is_some_and(|(subject, operand)| subject.starts_with(operand)),
            Comparator::EndsWith => str_pair(value, &cond.value)
                .is_some_and(|(subject, operand)| subject.ends_with(operand)),
            Comparator::Matches => self.regex_matches(value, &cond.value),
            Comparator::Exists | Comparator::IsNull => unreachable!("handled above"),
        }
    }

    fn regex_matches(&self, value: &Value, pattern: &Value) -> bool {
        let (Some(subject), Some(pattern)) = (value.as_str(), pattern.as_str()) else {
            return false;
        };
        let mut cache = match self.regex_cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !cache.contains_key(pattern) {
            match Regex::new(pattern) {
                Ok(re) => {
                    cache.insert(pattern.to_string(), re);
                }
                Err(error) => {
                    tracing::warn!(pattern, %error, "Invalid route regex, condition is false");
                    return false;
                }
            }
        }
        cache
            .get(pattern)
            .is_some_and(|re| re.is_match(subject))
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

fn contains(subject: &Value, operand: &Value) -> bool {
    match subject {
        Value::String(text) => operand.as_str().is_some_and(|needle| text.contains(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, operand)),
        _ => false,
    }
}

fn str_pair<'a>(left: &'a Value, right: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((left.as_str()?, right.as_str()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_types::definition::RouteBranch;
    use serde_json::json;

    fn cond(field: &str, cmp: Comparator, value: Value) -> RouteCondition {
        RouteCondition {
            field: field.into(),
            cmp,
            value,
        }
    }

    fn route(branches: Vec<RouteBranch>, default: Option<&str>) -> RouteConfig {
        RouteConfig {
            branches,
            default_branch: default.map(String::from),
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let evaluator = RouteEvaluator::new();
        let config = route(
            vec![
                RouteBranch {
                    name: "big".into(),
                    when: vec![cond("total", Comparator::Gte, json!(100))],
                },
                RouteBranch {
                    name: "any".into(),
                    when: vec![cond("total", Comparator::Gte, json!(0))],
                },
            ],
            None,
        );
        // Both branches match; the first declared one wins.
        let outcome = evaluator.evaluate(&config, &json!({"total": 250}));
        assert_eq!(outcome, RouteOutcome::Branch("big".into()));
    }

    #[test]
    fn conditions_within_a_branch_are_anded() {
        let evaluator = RouteEvaluator::new();
        let config = route(
            vec![RouteBranch {
                name: "eu-big".into(),
                when: vec![
                    cond("region", Comparator::Eq, json!("eu")),
                    cond("total", Comparator::Gt, json!(100)),
                ],
            }],
            Some("rest"),
        );
        assert_eq!(
            evaluator.evaluate(&config, &json!({"region": "eu", "total": 250})),
            RouteOutcome::Branch("eu-big".into())
        );
        assert_eq!(
            evaluator.evaluate(&config, &json!({"region": "eu", "total": 50})),
            RouteOutcome::Default("rest".into())
        );
    }

    #[test]
    fn unmatched_without_default_is_dropped() {
        let evaluator = RouteEvaluator::new();
        let config = route(
            vec![RouteBranch {
                name: "x".into(),
                when: vec![cond("kind", Comparator::Eq, json!("a"))],
            }],
            None,
        );
        assert_eq!(
            evaluator.evaluate(&config, &json!({"kind": "b"})),
            RouteOutcome::Dropped
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let evaluator = RouteEvaluator::new();
        let config = route(
            vec![RouteBranch {
                name: "m".into(),
                when: vec![cond("sku", Comparator::Matches, json!("^A-[0-9]+$"))],
            }],
            Some("rest"),
        );
        let record = json!({"sku": "A-42"});
        let first = evaluator.evaluate(&config, &record);
        for _ in 0..10 {
            assert_eq!(evaluator.evaluate(&config, &record), first);
        }
    }

    #[test]
    fn comparator_matrix() {
        let evaluator = RouteEvaluator::new();
        let record = json!({
            "qty": 5,
            "name": "Alpha",
            "tags": ["red", "blue"],
            "ghost": null
        });
        let cases = [
            (cond("qty", Comparator::Eq, json!(5)), true),
            (cond("qty", Comparator::Ne, json!(4)), true),
            (cond("qty", Comparator::Gt, json!(4)), true),
            (cond("qty", Comparator::Lte, json!(5)), true),
            (cond("qty", Comparator::In, json!([1, 5, 9])), true),
            (cond("qty", Comparator::NotIn, json!([1, 9])), true),
            (cond("name", Comparator::StartsWith, json!("Al")), true),
            (cond("name", Comparator::EndsWith, json!("pha")), true),
            (cond("name", Comparator::Contains, json!("lph")), true),
            (cond("tags", Comparator::Contains, json!("red")), true),
            (cond("tags", Comparator::NotContains, json!("green")), true),
            (cond("name", Comparator::Matches, json!("^A.*a$")), true),
            (cond("qty", Comparator::Exists, json!(null)), true),
            (cond("ghost", Comparator::IsNull, json!(null)), true),
            (cond("absent", Comparator::IsNull, json!(null)), true),
            (cond("absent", Comparator::Exists, json!(null)), false),
            (cond("qty", Comparator::IsNull, json!(null)), false),
            (cond("name", Comparator::Gt, json!(5)), false),
        ];
        for (condition, expected) in cases {
            assert_eq!(
                evaluator.condition_matches(&condition, &record),
                expected,
                "condition failed: {condition:?}"
            );
        }
    }

    #[test]
    fn invalid_regex_is_false_not_fatal() {
        let evaluator = RouteEvaluator::new();
        let condition = cond("name", Comparator::Matches, json!("([unclosed"));
        assert!(!evaluator.condition_matches(&condition, &json!({"name": "x"})));
    }
}
