//! Flat argument bags.

use crate::error::BindError;
use crate::path::{self, Segment};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A flat mapping from argument path to JSON scalar.
///
/// On the wire a bag is a single JSON object, e.g.
/// `{"code":1,"name":"x","cards[0].code":2}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentBag {
    entries: BTreeMap<String, Value>,
}

impl ArgumentBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a message payload. An empty payload is an empty bag.
    pub fn from_json_bytes(data: &[u8]) -> Result<Self, BindError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }
        match serde_json::from_slice::<Value>(data)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(BindError::NotAnObject),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, BindError> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(path.into(), value.into())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        self.entries.remove(path)
    }

    pub fn contains_key(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Returns the entries lying under `prefix`, re-keyed relative to it.
    ///
    /// An entry keyed exactly `prefix` lands at the empty path.
    pub fn scoped(&self, prefix: &str) -> ArgumentBag {
        if prefix.is_empty() {
            return self.clone();
        }
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, value)| {
                path::strip_prefix(key, prefix).map(|rest| (rest.to_string(), value.clone()))
            })
            .collect()
    }

    /// Rebuilds the nested JSON tree the bag describes, with lists capped at
    /// [`DEFAULT_MAX_LIST_LEN`](crate::DEFAULT_MAX_LIST_LEN) elements.
    pub fn to_tree(&self) -> Result<Value, BindError> {
        self.to_tree_limited(crate::DEFAULT_MAX_LIST_LEN)
    }

    /// Rebuilds the nested JSON tree, rejecting any list index at or past
    /// `max_list_len`.
    pub fn to_tree_limited(&self, max_list_len: usize) -> Result<Value, BindError> {
        let mut root = Value::Null;
        for (key, value) in &self.entries {
            let segments = path::parse(key)?;
            insert_at(&mut root, &segments, value.clone(), key, max_list_len)?;
        }
        Ok(root)
    }

    /// Flattens a JSON tree into a bag. Empty containers are kept as leaves.
    pub fn from_tree(tree: &Value) -> Result<ArgumentBag, BindError> {
        let mut bag = ArgumentBag::new();
        flatten_tree(&mut bag, String::new(), tree)?;
        Ok(bag)
    }
}

fn insert_at(
    node: &mut Value,
    segments: &[Segment],
    value: Value,
    key: &str,
    max_list_len: usize,
) -> Result<(), BindError> {
    let Some((head, rest)) = segments.split_first() else {
        return merge(node, value, key);
    };

    match head {
        Segment::Field(name) | Segment::MapKey(name) => {
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return Err(BindError::PathConflict(key.to_string()));
            };
            let child = map.entry(name.clone()).or_insert(Value::Null);
            insert_at(child, rest, value, key, max_list_len)
        }
        Segment::Index(index) => {
            if node.is_null() {
                *node = Value::Array(Vec::new());
            }
            let Value::Array(items) = node else {
                return Err(BindError::PathConflict(key.to_string()));
            };
            let len = index
                .checked_add(1)
                .filter(|len| *len <= max_list_len)
                .ok_or_else(|| BindError::ListTooLong {
                    path: key.to_string(),
                    index: *index,
                    max: max_list_len,
                })?;
            if items.len() < len {
                items.resize(len, Value::Null);
            }
            insert_at(&mut items[*index], rest, value, key, max_list_len)
        }
    }
}

fn merge(node: &mut Value, value: Value, key: &str) -> Result<(), BindError> {
    if node.is_null() {
        *node = value;
        return Ok(());
    }
    match (node, value) {
        (_, Value::Null) => Ok(()),
        (Value::Object(existing), Value::Object(incoming)) => {
            for (name, child) in incoming {
                merge(existing.entry(name).or_insert(Value::Null), child, key)?;
            }
            Ok(())
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            if existing.len() < incoming.len() {
                existing.resize(incoming.len(), Value::Null);
            }
            for (slot, child) in existing.iter_mut().zip(incoming) {
                merge(slot, child, key)?;
            }
            Ok(())
        }
        _ => Err(BindError::PathConflict(key.to_string())),
    }
}

fn flatten_tree(bag: &mut ArgumentBag, prefix: String, node: &Value) -> Result<(), BindError> {
    match node {
        Value::Object(map) if !map.is_empty() => {
            for (name, child) in map {
                flatten_tree(bag, path::field(&prefix, name), child)?;
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                flatten_tree(bag, path::index(&prefix, i), child)?;
            }
        }
        leaf => {
            if prefix.is_empty() {
                return match leaf {
                    Value::Object(_) | Value::Array(_) => Ok(()),
                    _ => Err(BindError::NotAnObject),
                };
            }
            bag.insert(prefix, leaf.clone());
        }
    }
    Ok(())
}

impl FromIterator<(String, Value)> for ArgumentBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ArgumentBag {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ArgumentBag {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
