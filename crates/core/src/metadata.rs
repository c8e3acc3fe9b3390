//! Session metadata documents and deep-merge semantics.
//!
//! Metadata is a JSON-shaped document: a mapping from string keys to
//! [`MetadataValue`]s. Values are a closed set of variants so that the merge
//! rules below are total:
//!
//! - a key absent from the stored document is added;
//! - when both sides hold a [`MetadataValue::Document`], the two documents are
//!   merged recursively;
//! - in every other case the incoming value replaces the stored one, including
//!   sequences (no union) and type mismatches (the incoming type wins).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Top-level metadata key reserved for privileged callers.
pub const SYSTEM_METADATA_KEY: &str = "system";

/// A single metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<MetadataValue>),
    Document(Metadata),
}

impl MetadataValue {
    /// Returns the nested document, if this value is one.
    pub fn as_document(&self) -> Option<&Metadata> {
        match self {
            MetadataValue::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Returns the string, if this value is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for [`MetadataValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }
}

impl From<Value> for MetadataValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => MetadataValue::Null,
            Value::Bool(b) => MetadataValue::Bool(b),
            Value::Number(n) => MetadataValue::Number(n),
            Value::String(s) => MetadataValue::String(s),
            Value::Array(items) => {
                MetadataValue::Sequence(items.into_iter().map(MetadataValue::from).collect())
            }
            Value::Object(map) => MetadataValue::Document(Metadata::from(map)),
        }
    }
}

impl From<MetadataValue> for Value {
    fn from(value: MetadataValue) -> Self {
        match value {
            MetadataValue::Null => Value::Null,
            MetadataValue::Bool(b) => Value::Bool(b),
            MetadataValue::Number(n) => Value::Number(n),
            MetadataValue::String(s) => Value::String(s),
            MetadataValue::Sequence(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            MetadataValue::Document(doc) => Value::Object(doc.into()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        MetadataValue::Number(n.into())
    }
}

impl From<Metadata> for MetadataValue {
    fn from(doc: Metadata) -> Self {
        MetadataValue::Document(doc)
    }
}

/// A metadata document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Get the value stored under a top-level key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Returns true if a top-level key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a top-level key, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Option<MetadataValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a top-level key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.0.remove(key)
    }

    /// Merge `incoming` into this document in place.
    pub fn merge_from(&mut self, incoming: &Metadata) {
        for (key, value) in &incoming.0 {
            if let (Some(MetadataValue::Document(current)), MetadataValue::Document(patch)) =
                (self.0.get_mut(key), value)
            {
                current.merge_from(patch);
                continue;
            }
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Encode the document as a JSON string.
    pub fn to_json_string(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a document from a JSON string. The top level must be an object.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Deep-merge `incoming` into a copy of `existing`.
///
/// Neither input is modified. An empty `incoming` yields `existing` unchanged.
pub fn merge(existing: &Metadata, incoming: &Metadata) -> Metadata {
    let mut merged = existing.clone();
    merged.merge_from(incoming);
    merged
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(
            map.into_iter()
                .map(|(k, v)| (k, MetadataValue::from(v)))
                .collect(),
        )
    }
}

impl From<Metadata> for Map<String, Value> {
    fn from(doc: Metadata) -> Self {
        doc.0.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
    }
}

impl TryFrom<Value> for Metadata {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(crate::Error::Serialization(format!(
                "metadata must be a JSON object, got {other}"
            ))),
        }
    }
}

impl FromIterator<(String, MetadataValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetadataValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Metadata {
    type Item = (String, MetadataValue);
    type IntoIter = btree_map::IntoIter<String, MetadataValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a MetadataValue);
    type IntoIter = btree_map::Iter<'a, String, MetadataValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
