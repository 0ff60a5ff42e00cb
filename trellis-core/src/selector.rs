//! Label selectors used by strategies and sub-strategies.
//!
//! A selector is either `match_all`, a conjunction (`labels_and`) or a
//! disjunction (`labels_or`) of elements. Each element compares one label
//! against a value with one of the operators below.

use crate::{Labels, TrellisError, TrellisResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Comparison operator of a selector element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Nin,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Ge => "ge",
            Operator::Lt => "lt",
            Operator::Le => "le",
            Operator::In => "in",
            Operator::Nin => "nin",
        };
        write!(f, "{}", value)
    }
}

/// A single `key op value` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub key: String,
    pub op: Operator,
    pub value: Value,
}

impl Element {
    pub fn new(key: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Operator::Eq, Value::String(value.into()))
    }

    pub fn validate(&self) -> TrellisResult<()> {
        if self.key.trim().is_empty() {
            return Err(TrellisError::InvalidParameter(
                "selector element key is empty".to_string(),
            ));
        }
        let ok = match self.op {
            Operator::Eq | Operator::Ne => scalar_text(&self.value).is_some(),
            Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
                self.value.as_f64().is_some()
            }
            Operator::In | Operator::Nin => match &self.value {
                Value::Array(items) => items.iter().all(|v| scalar_text(v).is_some()),
                _ => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(TrellisError::InvalidParameter(format!(
                "selector element {} {} has mistyped value {}",
                self.key, self.op, self.value
            )))
        }
    }

    /// Evaluate this element against an instance's labels.
    ///
    /// A missing label matches only the negative operators (`ne`, `nin`).
    pub fn matches(&self, labels: &Labels) -> bool {
        let Some(label) = labels.get(&self.key) else {
            return matches!(self.op, Operator::Ne | Operator::Nin);
        };

        match self.op {
            Operator::Eq => scalar_text(&self.value).is_some_and(|v| v == *label),
            Operator::Ne => scalar_text(&self.value).map_or(true, |v| v != *label),
            Operator::Gt => compare(label, &self.value, |l, r| l > r),
            Operator::Ge => compare(label, &self.value, |l, r| l >= r),
            Operator::Lt => compare(label, &self.value, |l, r| l < r),
            Operator::Le => compare(label, &self.value, |l, r| l <= r),
            Operator::In => contains(&self.value, label),
            Operator::Nin => !contains(&self.value, label),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare(label: &str, value: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (label.trim().parse::<f64>(), value.as_f64()) {
        (Ok(l), Some(r)) => cmp(l, r),
        _ => false,
    }
}

fn contains(value: &Value, label: &str) -> bool {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(scalar_text)
            .any(|candidate| candidate == label),
        _ => false,
    }
}

/// Label selector of a strategy scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub match_all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_or: Vec<Element>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_and: Vec<Element>,
}

impl Selector {
    pub fn match_all() -> Self {
        Self {
            match_all: true,
            ..Default::default()
        }
    }

    pub fn all_of(elements: Vec<Element>) -> Self {
        Self {
            labels_and: elements,
            ..Default::default()
        }
    }

    pub fn any_of(elements: Vec<Element>) -> Self {
        Self {
            labels_or: elements,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.match_all && self.labels_or.is_empty() && self.labels_and.is_empty()
    }

    pub fn validate(&self) -> TrellisResult<()> {
        if self.match_all {
            if !self.labels_or.is_empty() || !self.labels_and.is_empty() {
                return Err(TrellisError::InvalidParameter(
                    "match_all selector must not carry label elements".to_string(),
                ));
            }
            return Ok(());
        }
        if self.is_empty() {
            return Err(TrellisError::InvalidParameter(
                "selector has no elements".to_string(),
            ));
        }
        if !self.labels_or.is_empty() && !self.labels_and.is_empty() {
            return Err(TrellisError::InvalidParameter(
                "selector cannot mix labels_or and labels_and".to_string(),
            ));
        }
        self.labels_or
            .iter()
            .chain(self.labels_and.iter())
            .try_for_each(Element::validate)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        if self.match_all {
            return true;
        }
        if !self.labels_and.is_empty() {
            return self.labels_and.iter().all(|e| e.matches(labels));
        }
        self.labels_or.iter().any(|e| e.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_eq_and_ne() {
        let prod = labels(&[("env", "prod")]);
        assert!(Element::equals("env", "prod").matches(&prod));
        assert!(!Element::equals("env", "test").matches(&prod));
        assert!(Element::new("env", Operator::Ne, "test").matches(&prod));
        assert!(Element::new("zone", Operator::Ne, "a").matches(&prod));
        assert!(!Element::equals("zone", "a").matches(&prod));
    }

    #[test]
    fn test_numeric_operators() {
        let l = labels(&[("shard", "12"), ("name", "web")]);
        assert!(Element::new("shard", Operator::Gt, 10).matches(&l));
        assert!(Element::new("shard", Operator::Ge, 12).matches(&l));
        assert!(!Element::new("shard", Operator::Lt, 12).matches(&l));
        assert!(Element::new("shard", Operator::Le, 12.5).matches(&l));
        assert!(!Element::new("name", Operator::Gt, 1).matches(&l));
    }

    #[test]
    fn test_set_operators() {
        let l = labels(&[("region", "eu")]);
        assert!(Element::new("region", Operator::In, json!(["us", "eu"])).matches(&l));
        assert!(!Element::new("region", Operator::Nin, json!(["us", "eu"])).matches(&l));
        assert!(Element::new("region", Operator::Nin, json!(["ap"])).matches(&l));
    }

    #[test]
    fn test_and_or_semantics() {
        let l = labels(&[("env", "prod"), ("region", "eu")]);
        let and = Selector::all_of(vec![Element::equals("env", "prod"), Element::equals("region", "us")]);
        let or = Selector::any_of(vec![Element::equals("env", "prod"), Element::equals("region", "us")]);
        assert!(!and.matches(&l));
        assert!(or.matches(&l));
        assert!(Selector::match_all().matches(&Labels::new()));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(Selector::default().validate().is_err());
        assert!(Selector::all_of(vec![Element::equals("", "x")]).validate().is_err());
        assert!(Selector::all_of(vec![Element::new("a", Operator::Gt, "x")])
            .validate()
            .is_err());
        assert!(Selector::all_of(vec![Element::new("a", Operator::In, "x")])
            .validate()
            .is_err());
        let mixed = Selector {
            match_all: false,
            labels_or: vec![Element::equals("a", "1")],
            labels_and: vec![Element::equals("b", "2")],
        };
        assert!(mixed.validate().is_err());
        assert!(Selector::match_all().validate().is_ok());
    }

    #[test]
    fn test_selector_json_shape() {
        let raw = r#"{"labels_and":[{"key":"env","op":"in","value":["prod","pre"]}]}"#;
        let selector: Selector = serde_json::from_str(raw).unwrap();
        assert!(selector.validate().is_ok());
        assert!(selector.matches(&labels(&[("env", "pre")])));
    }

    proptest! {
        #[test]
        fn prop_eq_matches_iff_label_equal(key in "[a-z]{1,6}", want in "[a-z0-9]{0,6}", have in "[a-z0-9]{0,6}") {
            let l: Labels = [(key.clone(), have.clone())].into_iter().collect();
            prop_assert_eq!(Element::equals(key.clone(), want.clone()).matches(&l), want == have);
        }

        #[test]
        fn prop_in_and_nin_are_complementary(value in "[a-z]{1,4}", set in proptest::collection::vec("[a-z]{1,4}", 0..5)) {
            let l: Labels = [("k".to_string(), value)].into_iter().collect();
            let items = Value::Array(set.into_iter().map(Value::String).collect());
            let inside = Element::new("k", Operator::In, items.clone()).matches(&l);
            let outside = Element::new("k", Operator::Nin, items).matches(&l);
            prop_assert_ne!(inside, outside);
        }
    }
}
