//! Primary keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PulseError, Result};

/// Key addressing one entity of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Read a key out of a JSON value. Integers and strings are keys;
    /// anything else is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .map(PrimaryKey::Int)
                .ok_or_else(|| PulseError::InvalidPrimaryKey(value.clone())),
            Value::String(text) => Ok(PrimaryKey::Str(text.clone())),
            other => Err(PulseError::InvalidPrimaryKey(other.clone())),
        }
    }

    /// Extract the key stored under `field` of an entity.
    pub fn of_item(item: &Value, field: &str) -> Result<Self> {
        match item.get(field) {
            Some(value) if !value.is_null() => Self::from_value(value),
            _ => Err(PulseError::MissingPrimaryKey {
                field: field.to_string(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PrimaryKey::Int(id) => Value::from(*id),
            PrimaryKey::Str(id) => Value::from(id.as_str()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(id) => write!(f, "{id}"),
            PrimaryKey::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(id: i64) -> Self {
        PrimaryKey::Int(id)
    }
}

impl From<i32> for PrimaryKey {
    fn from(id: i32) -> Self {
        PrimaryKey::Int(id.into())
    }
}

impl From<u32> for PrimaryKey {
    fn from(id: u32) -> Self {
        PrimaryKey::Int(id.into())
    }
}

impl From<&str> for PrimaryKey {
    fn from(id: &str) -> Self {
        PrimaryKey::Str(id.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(id: String) -> Self {
        PrimaryKey::Str(id)
    }
}

impl From<&PrimaryKey> for PrimaryKey {
    fn from(key: &PrimaryKey) -> Self {
        key.clone()
    }
}

/// One key or a list of keys.
pub trait IntoKeys {
    fn into_keys(self) -> Vec<PrimaryKey>;
}

macro_rules! single_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoKeys for $ty {
                fn into_keys(self) -> Vec<PrimaryKey> {
                    vec![self.into()]
                }
            }
        )*
    };
}

single_key!(PrimaryKey, &PrimaryKey, i64, i32, u32, &str, String);

impl IntoKeys for () {
    fn into_keys(self) -> Vec<PrimaryKey> {
        Vec::new()
    }
}

impl<K: Into<PrimaryKey>> IntoKeys for Vec<K> {
    fn into_keys(self) -> Vec<PrimaryKey> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<K: Into<PrimaryKey> + Clone> IntoKeys for &[K] {
    fn into_keys(self) -> Vec<PrimaryKey> {
        self.iter().cloned().map(Into::into).collect()
    }
}

impl<K: Into<PrimaryKey>, const N: usize> IntoKeys for [K; N] {
    fn into_keys(self) -> Vec<PrimaryKey> {
        self.into_iter().map(Into::into).collect()
    }
}

/// One group name or a list of names. `()` means none.
pub trait IntoNames {
    fn into_names(self) -> Vec<String>;
}

impl IntoNames for () {
    fn into_names(self) -> Vec<String> {
        Vec::new()
    }
}

impl IntoNames for &str {
    fn into_names(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoNames for String {
    fn into_names(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoNames for &[&str] {
    fn into_names(self) -> Vec<String> {
        self.iter().map(|name| name.to_string()).collect()
    }
}

impl<const N: usize> IntoNames for [&str; N] {
    fn into_names(self) -> Vec<String> {
        self.iter().map(|name| name.to_string()).collect()
    }
}

impl IntoNames for Vec<String> {
    fn into_names(self) -> Vec<String> {
        self
    }
}

impl IntoNames for &[String] {
    fn into_names(self) -> Vec<String> {
        self.to_vec()
    }
}

/// Parse a raw group index into keys, skipping entries that are not keys.
pub(crate) fn keys_of(index: &Value) -> Vec<PrimaryKey> {
    match index {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| PrimaryKey::from_value(entry).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn index_value(keys: &[PrimaryKey]) -> Value {
    Value::Array(keys.iter().map(PrimaryKey::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_from_items() {
        assert_eq!(
            PrimaryKey::of_item(&json!({"id": 1}), "id").unwrap(),
            PrimaryKey::Int(1)
        );
        assert_eq!(
            PrimaryKey::of_item(&json!({"slug": "x"}), "slug").unwrap(),
            PrimaryKey::Str("x".into())
        );
        assert!(matches!(
            PrimaryKey::of_item(&json!({"name": "x"}), "id"),
            Err(PulseError::MissingPrimaryKey { .. })
        ));
        assert!(matches!(
            PrimaryKey::of_item(&json!({"id": [1]}), "id"),
            Err(PulseError::InvalidPrimaryKey(_))
        ));
    }

    #[test]
    fn keys_serialize_untagged() {
        let keys = vec![PrimaryKey::Int(2), PrimaryKey::Str("b".into())];
        assert_eq!(serde_json::to_value(&keys).unwrap(), json!([2, "b"]));
        assert_eq!(keys_of(&json!([2, "b", null])), keys);
    }

    #[test]
    fn into_keys_accepts_one_or_many() {
        assert_eq!(1i64.into_keys(), vec![PrimaryKey::Int(1)]);
        assert_eq!(["a", "b"].into_keys().len(), 2);
        assert_eq!(vec![3i64, 4].into_keys()[1], PrimaryKey::Int(4));
        assert!(().into_keys().is_empty());
        assert!(().into_names().is_empty());
        assert_eq!(["x", "y"].into_names(), vec!["x", "y"]);
    }
}
