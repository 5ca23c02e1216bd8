//! Dynamic values carried by object-graph records and decoded legacy text.
//!
//! Upgrade steps must tolerate field shapes from any historical version, so
//! record fields are an open bag of [`Value`]s rather than typed entities.
//! Only the post-upgrade boundary hands records off to strongly typed
//! application structs.

use chrono::NaiveDateTime;

/// A dynamically typed value.
///
/// `Map` preserves insertion order and allows non-string keys because
/// legacy stores keyed some dicts by integer object ids.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absent/none marker.
    None,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    Text(String),
    /// A calendar date and time (no timezone).
    DateTime(NaiveDateTime),
    /// An ordered list.
    List(Vec<Value>),
    /// A fixed-shape sequence (legacy tuple syntax).
    Tuple(Vec<Value>),
    /// An ordered key/value mapping.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Returns true for `Value::None`.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Returns the integer payload, if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string payload, if this is `Text`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list payload, if this is a `List`.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the map pairs, if this is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Looks up a string key in a `Map`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Looks up an integer key in a `Map`.
    #[must_use]
    pub fn get_int_key(&self, key: i64) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_int() == Some(key))
            .map(|(_, v)| v)
    }

    /// Legacy truthiness: false for `None`, `Bool(false)`, `Int(0)`,
    /// empty text/containers; true otherwise.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::DateTime(_) => true,
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Map(pairs) => !pairs.is_empty(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}
