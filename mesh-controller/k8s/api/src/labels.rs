use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// An immutable, cheaply cloned label set.
#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Kubernetes label-selector semantics: every requirement must hold, and an
/// empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid label selector operator {0:?}")]
pub struct InvalidOperator(String);

// === impl Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().is_none_or(|m| m.is_empty())
            && self.match_expressions.as_ref().is_none_or(|e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        self.match_expressions
            .iter()
            .flatten()
            .all(|expr| expr.matches(labels.as_ref()))
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = InvalidOperator;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        let match_expressions = selector
            .match_expressions
            .iter()
            .flatten()
            .map(Expression::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            match_labels: selector.match_labels.clone(),
            match_expressions: Some(match_expressions).filter(|e| !e.is_empty()),
        })
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(iter.into_iter().collect()),
        }
    }
}

// === impl Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === impl Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl TryFrom<&LabelSelectorRequirement> for Expression {
    type Error = InvalidOperator;

    fn try_from(req: &LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let operator = match req.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            op => return Err(InvalidOperator(op.to_string())),
        };
        Ok(Self {
            key: req.key.clone(),
            operator,
            values: req.values.iter().flatten().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Selector::default(), Labels::default(), true)]
    #[case(
        Selector::from_iter(Some(("app", "bookstore"))),
        Labels::from_iter(vec![("app", "bookstore"), ("version", "v1")]),
        true
    )]
    #[case(
        Selector::from_iter(Some(("app", "bookstore"))),
        Labels::from_iter(Some(("app", "bookbuyer"))),
        false
    )]
    #[case(
        Selector::from_iter(Some(Expression::new("version", Operator::In, &["v1", "v2"]))),
        Labels::from_iter(Some(("version", "v2"))),
        true
    )]
    #[case(
        Selector::from_iter(Some(Expression::new("version", Operator::NotIn, &["v1"]))),
        Labels::from_iter(Some(("version", "v1"))),
        false
    )]
    #[case(
        Selector::from_iter(Some(Expression::new("version", Operator::NotIn, &["v1"]))),
        Labels::default(),
        true
    )]
    #[case(
        Selector::from_iter(Some(Expression::new("canary", Operator::Exists, &[]))),
        Labels::from_iter(Some(("canary", "true"))),
        true
    )]
    #[case(
        Selector::from_iter(Some(Expression::new("canary", Operator::DoesNotExist, &[]))),
        Labels::from_iter(Some(("canary", "true"))),
        false
    )]
    fn selector_matches(#[case] selector: Selector, #[case] labels: Labels, #[case] expected: bool) {
        assert_eq!(selector.matches(&labels), expected);
    }

    #[test]
    fn converts_label_selectors() {
        let ls = LabelSelector {
            match_labels: Some(maplit::btreemap! {
                "app".to_string() => "bookstore".to_string(),
            }),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "version".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["v1".to_string()]),
            }]),
        };
        let selector = Selector::try_from(&ls).unwrap();
        assert!(selector.matches(&Labels::from_iter(vec![
            ("app", "bookstore"),
            ("version", "v1")
        ])));
        assert!(!selector.matches(&Labels::from_iter(Some(("app", "bookstore")))));

        let bad = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "version".to_string(),
                operator: "Gt".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert_eq!(
            Selector::try_from(&bad),
            Err(InvalidOperator("Gt".to_string()))
        );
    }
}
