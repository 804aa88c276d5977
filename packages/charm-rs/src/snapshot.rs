//! Serializable object state.
//!
//! A [`Snapshot`] is a map of field names to JSON values. Keys are kept sorted, so
//! encoding the same snapshot twice always yields the same bytes: loading a stored
//! snapshot and saving it again never rewrites the row.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named fields of primitive values, associated 1:1 with an object's handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Typed read of one field. `Ok(None)` if the field is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.0
            .get(key)
            .map(|v| T::deserialize(v))
            .transpose()
    }

    /// Raw read of one field.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed write of one field.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), serde_json::Error> {
        self.0.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Write `value` only if `key` is not present yet.
    pub fn set_default<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), serde_json::Error> {
        if !self.0.contains_key(key) {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Builder form of [`Snapshot::set`] for values that always serialize.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Canonical encoding used by the store.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A map of `Value`s has no failure modes when written to memory.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Decode bytes written by [`Snapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The snapshot as a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Snapshot {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
