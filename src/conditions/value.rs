use std::fmt;

use chrono::DateTime;
use derive_more::From;
use serde::Serialize;

use crate::properties::PropertyValue;

/// A runtime value inside a condition.
///
/// Timestamps are epoch milliseconds. They compare and subtract like integers but keep their
/// own variant so `formatTime` and history lookups know they are times.
#[derive(Debug, Clone, PartialEq, From, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent value, produced by missing properties and `nil`.
    #[from(ignore)]
    Nil,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    String(String),
    /// Point in time, as milliseconds since the Unix epoch.
    #[from(ignore)]
    Time(i64),
    /// Array literal.
    Array(Vec<Value>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::Int(i) => Value::Int(i),
            PropertyValue::Float(f) => Value::Float(f),
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Timestamp(t) => Value::Time(t.timestamp_millis()),
        }
    }
}

impl Value {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Time(_) => "time",
            Value::Array(_) => "array",
        }
    }

    pub(crate) fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// History lookups take property values. Nil and arrays have no property form.
    pub(crate) fn to_property_value(&self) -> Option<PropertyValue> {
        match self {
            Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            Value::Int(i) => Some(PropertyValue::Int(*i)),
            Value::Float(f) => Some(PropertyValue::Float(*f)),
            Value::String(s) => Some(PropertyValue::String(s.clone())),
            Value::Time(t) => DateTime::from_timestamp_millis(*t).map(PropertyValue::Timestamp),
            Value::Nil | Value::Array(_) => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Epoch milliseconds for time-like arguments. Integers are accepted as epoch milliseconds.
    pub(crate) fn as_time_millis(&self) -> Option<i64> {
        match self {
            Value::Time(t) | Value::Int(t) => Some(*t),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic and ordering. Times participate as epoch milliseconds.
    pub(crate) fn as_number(&self) -> Option<Number> {
        match self {
            Value::Int(i) | Value::Time(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Equality as seen by `==`: numbers compare across int and float, times compare with ints.
    pub(crate) fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.loosely_equals(b))
            }
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
                _ => a == b,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Time(t) => write!(f, "time({t})"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}
