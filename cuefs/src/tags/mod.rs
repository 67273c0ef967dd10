//! Case-insensitive, multi-valued tag dictionaries.
//!
//! Vorbis comments allow a key to appear multiple times and treat keys
//! case-insensitively. `TagMap` normalizes keys to upper case on insertion
//! and preserves value order per key. Iteration order is deterministic
//! (keys sorted), which keeps synthesized tag sets stable across runs.

use std::collections::BTreeMap;

/// A case-insensitive map from tag key to an ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl TagMap {
    /// Create an empty tag map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under the given key, keeping existing values.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_ascii_uppercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values of the given key.
    pub fn set(&mut self, key: &str, values: Vec<String>) {
        self.entries.insert(key.to_ascii_uppercase(), values);
    }

    /// Replace the key with a single value.
    pub fn set_one(&mut self, key: &str, value: impl Into<String>) {
        self.set(key, vec![value.into()]);
    }

    /// All values of a key, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .get(&key.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// First value of a key, or `None` if absent.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|vs| vs.first()).map(String::as_str)
    }

    /// Whether the key has at least one value.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_uppercase())
    }

    /// Remove a key and all its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(&key.to_ascii_uppercase())
    }

    /// Keep only the entries whose key satisfies the predicate.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }

    /// Drop every value that fails the predicate; keys left without values
    /// are removed entirely.
    pub fn retain_values(&mut self, mut keep: impl FnMut(&str) -> bool) {
        for values in self.entries.values_mut() {
            values.retain(|v| keep(v));
        }
        self.entries.retain(|_, vs| !vs.is_empty());
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, value)` pairs, keys in sorted order, values in
    /// insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = TagMap::new();
        for (k, v) in iter {
            let key: String = k.into();
            map.append(&key, v.into());
        }
        map
    }
}
