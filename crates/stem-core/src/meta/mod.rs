//! Metadata model.
//!
//! Meta は task の入力となる読み取り専用のツリーです。
//! A task only ever reads its meta: every "update" builds a new value.
//!
//! - **Meta**: key/value tree (JSON objects, or any `Serialize` record)
//! - **MetaType**: runtime type of a meta value, used by specifications
//! - **Specification** / **MetaVerification**: see the submodules

pub mod spec;
pub mod verification;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::spec::{SpecField, Specification};
pub use self::verification::{MetaFieldError, MetaVerification, VerificationEntry};

/// Read-only metadata tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(Value);

impl Meta {
    /// An empty map.
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Build meta from a fixed-field record.
    ///
    /// # 使用例
    /// ```ignore
    /// #[derive(Serialize)]
    /// struct Input { x: i64 }
    ///
    /// let meta = Meta::from_record(&Input { x: 5 })?;
    /// ```
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(record).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    /// Top-level lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.as_map().is_some_and(|map| map.contains_key(key))
    }

    /// Returns a copy with `entries` applied on top. `self` is untouched.
    ///
    /// Non-map meta is replaced by a fresh map holding only `entries`.
    pub fn updated<K, I>(&self, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut map = self.as_map().cloned().unwrap_or_default();
        for (key, value) in entries {
            map.insert(key.into(), value);
        }
        Self(Value::Object(map))
    }

    /// Returns a copy where keys only present in `defaults` are filled in.
    pub fn with_defaults(&self, defaults: &Meta) -> Self {
        let (Some(map), Some(defaults)) = (self.as_map(), defaults.as_map()) else {
            return self.clone();
        };
        let mut merged = map.clone();
        for (key, value) in defaults {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        Self(Value::Object(merged))
    }

    /// Meta forwarded to the dependency named `name`.
    pub fn for_dependency(&self, name: &str, routing: MetaRouting) -> Self {
        match routing {
            MetaRouting::Shared => self.clone(),
            MetaRouting::Overlay => match self.get(name).and_then(Value::as_object) {
                Some(sub) => self.updated(sub.iter().map(|(k, v)| (k.clone(), v.clone()))),
                None => self.clone(),
            },
        }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Value> for Meta {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Map<String, Value>> for Meta {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How a parent's meta is distributed to its dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaRouting {
    /// Every dependency sees the full meta; an object stored under the
    /// dependency's name overrides top-level keys for that dependency only.
    #[default]
    Overlay,
    /// Every dependency sees exactly the parent's meta.
    Shared,
}

/// Runtime type of a meta value.
///
/// `Integer` and `Float` are both subtypes of `Number`; `Any` accepts every
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaType {
    Any,
    Null,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "int")]
    Integer,
    Float,
    Number,
    #[serde(alias = "str")]
    String,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "map", alias = "dict")]
    Object,
}

impl MetaType {
    /// The most specific type of `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => MetaType::Null,
            Value::Bool(_) => MetaType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => MetaType::Integer,
            Value::Number(_) => MetaType::Float,
            Value::String(_) => MetaType::String,
            Value::Array(_) => MetaType::Array,
            Value::Object(_) => MetaType::Object,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            MetaType::Any => true,
            MetaType::Number => value.is_number(),
            other => *other == MetaType::of(value),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetaType::Any => "any",
            MetaType::Null => "null",
            MetaType::Bool => "bool",
            MetaType::Integer => "integer",
            MetaType::Float => "float",
            MetaType::Number => "number",
            MetaType::String => "string",
            MetaType::Array => "array",
            MetaType::Object => "object",
        }
    }
}

impl fmt::Display for MetaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
