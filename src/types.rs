//! Script identities, parameters and typed results.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Result, ScriptError};

/// Identity of a cacheable script.
///
/// `content_hash` is the cache key. `name` only shows up in diagnostics, so
/// two identities with the same hash share one compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptIdentity {
    pub name: String,
    pub content_hash: String,
}

impl ScriptIdentity {
    pub fn new(name: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_hash: content_hash.into(),
        }
    }

    /// Derive the identity of `source` using its SHA-256 digest as the hash.
    pub fn from_source(name: impl Into<String>, source: &str) -> Self {
        Self::new(name, content_hash(source))
    }
}

/// Lowercase hex SHA-256 of the script source.
pub fn content_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Logical scope selecting the worker pool for async execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionPath(String);

impl ExecutionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn for_organization(organization_id: i64) -> Self {
        Self(format!("org:{organization_id}"))
    }

    pub fn for_event(organization_id: i64, event_id: i64) -> Self {
        Self(format!("org:{organization_id}-event:{event_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ExecutionPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Named values handed to a script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionParameters(HashMap<String, Value>);

impl ExecutionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, Value>> for ExecutionParameters {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ExecutionParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for ExecutionParameters {
    type Item = (String, Value);
    type IntoIter = std::collections::hash_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Shape a script result is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    /// Anything, including nothing.
    Any,
    /// No value.
    Unit,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl ReturnType {
    /// Tag exposed to scripts through the `returnType` binding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnType::Any => "any",
            ReturnType::Unit => "unit",
            ReturnType::Boolean => "boolean",
            ReturnType::Integer => "integer",
            ReturnType::Number => "number",
            ReturnType::String => "string",
            ReturnType::Array => "array",
            ReturnType::Object => "object",
        }
    }

    /// Check whether `value` has this shape.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ReturnType::Any => true,
            ReturnType::Unit => value.is_null(),
            ReturnType::Boolean => value.is_boolean(),
            ReturnType::Integer => value.is_i64() || value.is_u64(),
            ReturnType::Number => value.is_number(),
            ReturnType::String => value.is_string(),
            ReturnType::Array => value.is_array(),
            ReturnType::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust type a script result can be converted into.
///
/// Implement it for your own `Deserialize` types (usually with
/// `ReturnType::Object`) to receive structured results.
pub trait ScriptReturn: DeserializeOwned {
    const RETURN_TYPE: ReturnType;
}

macro_rules! script_return {
    ($tag:expr => $($ty:ty),+) => {
        $(impl ScriptReturn for $ty {
            const RETURN_TYPE: ReturnType = $tag;
        })+
    };
}

script_return!(ReturnType::Any => Value);
script_return!(ReturnType::Unit => ());
script_return!(ReturnType::Boolean => bool);
script_return!(ReturnType::Integer => i32, i64, u32, u64);
script_return!(ReturnType::Number => f32, f64);
script_return!(ReturnType::String => String);

impl<T: DeserializeOwned> ScriptReturn for Vec<T> {
    const RETURN_TYPE: ReturnType = ReturnType::Array;
}

impl<T: DeserializeOwned> ScriptReturn for HashMap<String, T> {
    const RETURN_TYPE: ReturnType = ReturnType::Object;
}

impl<T: DeserializeOwned> ScriptReturn for BTreeMap<String, T> {
    const RETURN_TYPE: ReturnType = ReturnType::Object;
}

/// Raw script result tagged with the shape the caller expects.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptValue {
    expected: ReturnType,
    value: Value,
}

impl ScriptValue {
    pub fn new(expected: ReturnType, value: Value) -> Self {
        Self { expected, value }
    }

    pub fn expected(&self) -> ReturnType {
        self.expected
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Convert into `T`, failing on a shape mismatch instead of coercing.
    ///
    /// An empty Lua table has no shape of its own, so an empty object is
    /// accepted as an empty array and the other way around.
    pub fn convert<T: ScriptReturn>(mut self) -> Result<T> {
        self.value = match (self.expected, self.value) {
            (ReturnType::Array, Value::Object(map)) if map.is_empty() => Value::Array(Vec::new()),
            (ReturnType::Object, Value::Array(items)) if items.is_empty() => {
                Value::Object(serde_json::Map::new())
            }
            (_, value) => value,
        };
        if !self.expected.accepts(&self.value) {
            return Err(ScriptError::Conversion {
                expected: self.expected,
                message: format!("script returned {}", describe(&self.value)),
            });
        }
        serde_json::from_value(self.value).map_err(|e| ScriptError::Conversion {
            expected: self.expected,
            message: e.to_string(),
        })
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "nothing",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a floating point number",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
