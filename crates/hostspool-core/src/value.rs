//! Tagged property value read from and written to the deployment store.
//!
//! Topology properties and instance attributes are JSON-like. `Value`
//! keeps them typed and defines how each variant renders as a raw string,
//! which is what filters and capacity labels consume.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid boolean: {0:?}")]
    InvalidBool(String),

    #[error("invalid JSON value: {0}")]
    InvalidJson(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Raw string rendering: scalars render bare, lists and maps as JSON,
    /// null as the empty string.
    pub fn raw_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Whether the value carries nothing usable (null or empty string).
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ValueError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(ValueError::UnexpectedType {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>, ValueError> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(ValueError::UnexpectedType {
                expected: "map",
                found: other.type_name(),
            }),
        }
    }

    /// Interpret as a boolean; strings accept the usual spellings.
    pub fn to_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(ValueError::InvalidBool(s.clone())),
            },
            Value::Integer(1) => Ok(true),
            Value::Integer(0) => Ok(false),
            other => Err(ValueError::UnexpectedType {
                expected: "bool",
                found: other.type_name(),
            }),
        }
    }

    /// A list of strings, either native or JSON-encoded in a string.
    pub fn to_string_list(&self) -> Result<Vec<String>, ValueError> {
        match self {
            Value::Null => Ok(Vec::new()),
            Value::List(items) => Ok(items.iter().map(Value::raw_string).collect()),
            Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ValueError::InvalidJson(e.to_string()))
            }
            other => Err(ValueError::UnexpectedType {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}
