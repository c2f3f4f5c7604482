//! Record predicates used by route filters and hook scripts.
//!
//! Supported forms:
//! - `field == "value"` / `field != "value"` (JSON literal or bare word)
//! - `field contains "substr"` (strings and arrays)
//! - `field exists`
//! - `field` (truthy) and `!field` (falsy)
//!
//! Fields may be dotted paths into nested objects.

use serde_json::Value;

use crate::error::{Result, SluiceError};
use crate::types::Record;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(String, Value),
    NotEquals(String, Value),
    Contains(String, Value),
    Exists(String),
    Truthy(String),
    Not(Box<Condition>),
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(SluiceError::InvalidPipeline("empty condition".into()));
        }

        if let Some((field, rhs)) = split_operator(expr, " contains ") {
            return Ok(Self::Contains(field?, literal(rhs)));
        }
        if let Some((field, rhs)) = split_operator(expr, "!=") {
            return Ok(Self::NotEquals(field?, literal(rhs)));
        }
        if let Some((field, rhs)) = split_operator(expr, "==") {
            return Ok(Self::Equals(field?, literal(rhs)));
        }
        if let Some(field) = expr.strip_suffix(" exists") {
            return Ok(Self::Exists(field_name(field)?));
        }
        if let Some(inner) = expr.strip_prefix('!') {
            return Ok(Self::Not(Box::new(Self::parse(inner)?)));
        }
        Ok(Self::Truthy(field_name(expr)?))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Equals(field, expected) => lookup(record, field).is_some_and(|v| v == expected),
            Self::NotEquals(field, expected) => {
                lookup(record, field).map_or(true, |v| v != expected)
            }
            Self::Contains(field, needle) => match (lookup(record, field), needle) {
                (Some(Value::String(hay)), Value::String(n)) => hay.contains(n.as_str()),
                (Some(Value::Array(items)), n) => items.contains(n),
                _ => false,
            },
            Self::Exists(field) => lookup(record, field).is_some(),
            Self::Truthy(field) => lookup(record, field).is_some_and(is_truthy),
            Self::Not(inner) => !inner.matches(record),
        }
    }
}

/// Resolve a dotted path inside a record.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Parse the right-hand side: a JSON literal, or else a bare word.
pub fn literal(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(Result<String>, &'a str)> {
    let (lhs, rhs) = expr.split_once(op)?;
    Some((field_name(lhs), rhs))
}

fn field_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(SluiceError::InvalidPipeline(format!(
            "invalid field name in condition: '{name}'"
        )));
    }
    Ok(name.to_string())
}
