// Query key identity.
// Keys are ordered JSON values compared by their canonical serialized form.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a query: an ordered sequence of JSON values.
///
/// Object members are stored sorted, so two keys built from the same
/// members in a different insertion order are equal and hash the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Create a key from its parts.
    pub fn new<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Parts of the key, in order.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical serialized form, used as the cache map key.
    pub fn query_hash(&self) -> String {
        Value::Array(self.0.clone()).to_string()
    }

    /// Check whether `prefix` partially matches this key.
    ///
    /// Every part of the prefix must match the part at the same position.
    /// Object parts match when the prefix object's members are a subset of
    /// the key object's members.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.0.len() <= self.0.len()
            && self
                .0
                .iter()
                .zip(prefix.0.iter())
                .all(|(part, wanted)| partial_match(part, wanted))
    }
}

fn partial_match(value: &Value, wanted: &Value) -> bool {
    match (value, wanted) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(k, w)| have.get(k).is_some_and(|h| partial_match(h, w))),
        (Value::Array(have), Value::Array(want)) => {
            want.len() <= have.len()
                && have
                    .iter()
                    .zip(want.iter())
                    .all(|(h, w)| partial_match(h, w))
        }
        _ => value == wanted,
    }
}

// serde_json never produces NaN, so equality is total.
impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.query_hash().hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query_hash())
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(name: &str) -> Self {
        Self(vec![Value::String(name.to_string())])
    }
}
