//! Attribute values attached to variables and datasets.

use serde_json::Value;
use std::collections::BTreeMap;

/// Attributes keyed by name.
pub type Attributes = BTreeMap<String, AttrValue>;

/// A single attribute value. DAP attributes are always lists, so every
/// variant holds a vector; single-element lists are the common case.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl AttrValue {
    pub fn text(s: impl Into<String>) -> Self {
        AttrValue::Text(vec![s.into()])
    }

    pub fn int(v: i64) -> Self {
        AttrValue::Int(vec![v])
    }

    pub fn float(v: f64) -> Self {
        AttrValue::Float(vec![v])
    }

    /// The value as a string, if it is a single text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(v) if v.len() == 1 => Some(&v[0]),
            _ => None,
        }
    }

    /// The value as a float, if it is a single number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) if v.len() == 1 => Some(v[0] as f64),
            AttrValue::Float(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    /// JSON representation; single-element lists become scalars.
    pub fn to_json(&self) -> Value {
        fn collapse(mut values: Vec<Value>) -> Value {
            if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            }
        }

        match self {
            AttrValue::Text(v) => collapse(v.iter().map(|s| Value::from(s.as_str())).collect()),
            AttrValue::Int(v) => collapse(v.iter().map(|&i| Value::from(i)).collect()),
            AttrValue::Float(v) => collapse(v.iter().map(|&f| float_to_json(f)).collect()),
        }
    }
}

/// JSON has no NaN/Infinity; follow the Zarr convention of string markers.
fn float_to_json(f: f64) -> Value {
    if f.is_nan() {
        Value::from("NaN")
    } else if f.is_infinite() {
        Value::from(if f > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        Value::from(f)
    }
}

/// Convert an attribute map into a JSON object.
pub fn attributes_to_json(attrs: &Attributes) -> serde_json::Map<String, Value> {
    attrs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}
