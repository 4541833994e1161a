//! Authorization-context values and `${...}` extraction expressions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Why an extraction produced no value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no value at '{0}'")]
    Missing(String),
    #[error("value at '{0}' is null")]
    Null(String),
    #[error("invalid extraction expression '{0}'")]
    InvalidExpression(String),
}

/// A typed authorization-context value.
///
/// There is no null variant: an extraction that lands on JSON `null` is a
/// miss, while `false` and `0` are ordinary values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AzdValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<AzdValue>),
    Map(BTreeMap<String, AzdValue>),
}

impl AzdValue {
    /// Convert a JSON value. Top-level `null` yields `None`; nulls nested in
    /// arrays or objects are dropped.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(AzdValue::Bool(*b)),
            Value::Number(n) => Some(AzdValue::Number(n.clone())),
            Value::String(s) => Some(AzdValue::String(s.clone())),
            Value::Array(items) => Some(AzdValue::List(
                items.iter().filter_map(AzdValue::from_json).collect(),
            )),
            Value::Object(map) => Some(AzdValue::Map(
                map.iter()
                    .filter_map(|(k, v)| AzdValue::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AzdValue::Bool(b) => Value::Bool(*b),
            AzdValue::Number(n) => Value::Number(n.clone()),
            AzdValue::String(s) => Value::String(s.clone()),
            AzdValue::List(items) => Value::Array(items.iter().map(AzdValue::to_json).collect()),
            AzdValue::Map(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AzdValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view, accepting numeric strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AzdValue::Number(n) => n.as_i64(),
            AzdValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Float view, accepting numeric strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AzdValue::Number(n) => n.as_f64(),
            AzdValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AzdValue::Bool(b) => Some(*b),
            AzdValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for AzdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AzdValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for AzdValue {
    fn from(s: &str) -> Self {
        AzdValue::String(s.to_string())
    }
}

impl From<i64> for AzdValue {
    fn from(n: i64) -> Self {
        AzdValue::Number(n.into())
    }
}

impl From<bool> for AzdValue {
    fn from(b: bool) -> Self {
        AzdValue::Bool(b)
    }
}

/// A dotted lookup path such as `body.order.items.0.id`.
///
/// `\.` escapes a literal dot inside a key. Numeric segments index arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    segments: Vec<String>,
}

impl Expression {
    pub fn parse(path: &str) -> Result<Self, ExtractionError> {
        let invalid = || ExtractionError::InvalidExpression(path.to_string());

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = path.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => current.push(chars.next().ok_or_else(invalid)?),
                '.' => {
                    if current.is_empty() {
                        return Err(invalid());
                    }
                    segments.push(std::mem::take(&mut current));
                }
                c => current.push(c),
            }
        }
        if current.is_empty() {
            return Err(invalid());
        }
        segments.push(current);

        Ok(Self {
            source: path.to_string(),
            segments,
        })
    }

    /// Parse a `${path}` wrapper. Returns `None` when `raw` is not wrapped.
    pub fn parse_wrapped(raw: &str) -> Result<Option<Self>, ExtractionError> {
        match raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            Some(inner) => Self::parse(inner.trim()).map(Some),
            None => Ok(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.source
    }

    /// Walk the document. `None` when any segment misses.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(doc, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn evaluate(&self, doc: &Value) -> Result<AzdValue, ExtractionError> {
        let value = self
            .lookup(doc)
            .ok_or_else(|| ExtractionError::Missing(self.source.clone()))?;
        AzdValue::from_json(value).ok_or_else(|| ExtractionError::Null(self.source.clone()))
    }
}

/// One authorization-context field source: a literal or an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSource {
    Literal(String),
    Expression(Expression),
}

impl ValueSource {
    pub fn parse(raw: &str) -> Result<Self, ExtractionError> {
        Ok(match Expression::parse_wrapped(raw)? {
            Some(expr) => ValueSource::Expression(expr),
            None => ValueSource::Literal(raw.to_string()),
        })
    }

    pub fn resolve(&self, doc: &Value) -> Result<AzdValue, ExtractionError> {
        match self {
            ValueSource::Literal(s) => Ok(AzdValue::String(s.clone())),
            ValueSource::Expression(expr) => expr.evaluate(doc),
        }
    }
}

/// Resolve every `${...}` string inside a JSON template against `doc`.
///
/// Non-expression strings and scalars pass through unchanged. An expression
/// that misses is an error.
pub fn resolve_template(template: &Value, doc: &Value) -> Result<Value, ExtractionError> {
    match template {
        Value::String(raw) => match Expression::parse_wrapped(raw)? {
            Some(expr) => expr
                .lookup(doc)
                .cloned()
                .ok_or_else(|| ExtractionError::Missing(expr.path().to_string())),
            None => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_template(item, doc))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_template(v, doc).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
