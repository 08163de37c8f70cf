//! Field-level partial updates applied to JSON documents.
//!
//! A patch is a list of [`FieldOp`]s, each addressing a nested field by a
//! [`FieldPath`] of object keys. Intermediate objects are created on `Set`
//! and `Increment`; `Delete` of a missing field is a no-op.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::CoreError;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(CoreError::InvalidFieldPath(segments.join(".")));
        }
        Ok(Self(segments))
    }

    /// Single-segment path. Empty keys are rejected when applied.
    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![key.into()])
    }

    /// Two-segment path, e.g. `d.<column>`.
    pub fn nested(parent: impl Into<String>, key: impl Into<String>) -> Self {
        Self(vec![parent.into(), key.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn first(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({})", self.0.join("."))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    Set { path: FieldPath, value: Value },
    Delete { path: FieldPath },
    Increment { path: FieldPath, by: i64 },
}

impl FieldOp {
    pub fn set(path: FieldPath, value: impl Into<Value>) -> Self {
        Self::Set {
            path,
            value: value.into(),
        }
    }

    pub fn delete(path: FieldPath) -> Self {
        Self::Delete { path }
    }

    pub fn path(&self) -> &FieldPath {
        match self {
            Self::Set { path, .. } | Self::Delete { path } | Self::Increment { path, .. } => path,
        }
    }
}

/// Apply `ops` in order to `doc`. A `Null` document becomes an empty object.
pub fn apply_field_ops(doc: &mut Value, ops: &[FieldOp]) -> Result<(), CoreError> {
    if doc.is_null() {
        *doc = Value::Object(Map::new());
    }
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &FieldOp) -> Result<(), CoreError> {
    let path = op.path();
    let (leaf, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| CoreError::InvalidFieldPath(String::new()))?;
    if leaf.is_empty() || parents.iter().any(String::is_empty) {
        return Err(CoreError::InvalidFieldPath(path.to_string()));
    }

    match op {
        FieldOp::Set { value, .. } => {
            let parent = descend_creating(doc, parents)?;
            parent.insert(leaf.clone(), value.clone());
        }
        FieldOp::Delete { .. } => {
            if let Some(parent) = descend_existing(doc, parents) {
                parent.remove(leaf);
            }
        }
        FieldOp::Increment { by, .. } => {
            let parent = descend_creating(doc, parents)?;
            let next = match parent.get(leaf) {
                Some(Value::Number(n)) => increment(n, *by),
                _ => Value::Number(Number::from(*by)),
            };
            parent.insert(leaf.clone(), next);
        }
    }
    Ok(())
}

fn increment(n: &Number, by: i64) -> Value {
    if let Some(i) = n.as_i64() {
        if let Some(sum) = i.checked_add(by) {
            return Value::Number(Number::from(sum));
        }
    }
    let f = n.as_f64().unwrap_or(0.0) + by as f64;
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn descend_creating<'a>(
    doc: &'a mut Value,
    segments: &[String],
) -> Result<&'a mut Map<String, Value>, CoreError> {
    let mut cursor = doc;
    for segment in segments {
        let map = as_object_mut(cursor);
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(as_object_mut(cursor))
}

fn descend_existing<'a>(
    doc: &'a mut Value,
    segments: &[String],
) -> Option<&'a mut Map<String, Value>> {
    let mut cursor = doc;
    for segment in segments {
        cursor = cursor.as_object_mut()?.get_mut(segment)?;
    }
    cursor.as_object_mut()
}

/// Coerce `value` into an object, replacing any scalar in the way.
fn as_object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}
