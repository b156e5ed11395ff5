//! Resource names, query parameters and cache keys
//!
//! A [`CacheKey`] is compared structurally: two keys built independently from
//! the same resource and the same parameters are the same key. Parameters are
//! held in a `BTreeMap` so insertion order never leaks into equality or
//! hashing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row as returned by the remote store.
pub type Row = serde_json::Value;

/// A query result.
pub type Rows = Vec<Row>;

/// Name of a remote resource (table or view), e.g. `invoices`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A hashable parameter value.
///
/// Floats are unsupported: they have no total equality and
/// would make structurally equal keys compare unequal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// JSON form, for handing to the remote store.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Null => serde_json::Value::Null,
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Text(s) => serde_json::Value::String(s.clone()),
            ParamValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ParamValue::to_json).collect())
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<uuid::Uuid> for ParamValue {
    fn from(value: uuid::Uuid) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::Null, Into::into)
    }
}

/// Filter parameters of a query, keyed by column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&ParamValue> {
        self.0.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// JSON object form, for handing to the remote store.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Identity of one cached query result: resource plus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub resource: ResourceName,
    pub params: QueryParams,
}

impl CacheKey {
    /// Key for the unfiltered query of `resource`.
    pub fn new(resource: impl Into<ResourceName>) -> Self {
        Self {
            resource: resource.into(),
            params: QueryParams::new(),
        }
    }

    pub fn with_params(resource: impl Into<ResourceName>, params: QueryParams) -> Self {
        Self {
            resource: resource.into(),
            params,
        }
    }

    pub fn with_param(mut self, column: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(column, value);
        self
    }

    pub fn belongs_to(&self, resource: &ResourceName) -> bool {
        &self.resource == resource
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if self.params.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (column, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", column, value.to_json())?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_cache_key_structural_equality() {
        let a = CacheKey::new("invoices")
            .with_param("status", "open")
            .with_param("client_id", 7);
        let b = CacheKey::new("invoices")
            .with_param("client_id", 7)
            .with_param("status", "open");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_cache_key_differs_by_resource_and_params() {
        let base = CacheKey::new("invoices");
        assert_ne!(base, CacheKey::new("clients"));
        assert_ne!(base, CacheKey::new("invoices").with_param("status", "open"));
    }

    #[test]
    fn test_belongs_to() {
        let key = CacheKey::new("projects").with_param("archived", false);
        assert!(key.belongs_to(&ResourceName::new("projects")));
        assert!(!key.belongs_to(&ResourceName::new("tasks")));
    }

    #[test]
    fn test_params_to_json() {
        let params = QueryParams::new()
            .with("status", "paid")
            .with("tags", ParamValue::List(vec!["a".into(), "b".into()]))
            .with("due", Option::<i64>::None);
        let json = params.to_json();
        assert_eq!(json["status"], "paid");
        assert_eq!(json["tags"][1], "b");
        assert!(json["due"].is_null());
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheKey::new("clients").to_string(), "clients");
        let key = CacheKey::new("invoices").with_param("status", "open");
        assert_eq!(key.to_string(), "invoices{status=\"open\"}");
    }
}
