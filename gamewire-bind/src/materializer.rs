//! Configurable flatten/unflatten front end.

use crate::bag::ArgumentBag;
use crate::error::BindError;
use crate::flatten::Flattener;
use crate::unflatten;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Converts between typed values and argument bags.
///
/// A session may carry its own materializer; otherwise the dispatcher uses
/// [`Materializer::default`].
#[derive(Debug, Clone)]
pub struct Materializer {
    max_depth: usize,
    max_list_len: usize,
    lenient: bool,
}

impl Default for Materializer {
    fn default() -> Self {
        Self {
            max_depth: crate::DEFAULT_MAX_DEPTH,
            max_list_len: crate::DEFAULT_MAX_LIST_LEN,
            lenient: true,
        }
    }
}

impl Materializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flattening nesting limit.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Caps the length of any list rebuilt from an incoming bag. An index
    /// at or past the cap fails the bind.
    pub fn with_max_list_len(mut self, max_list_len: usize) -> Self {
        self.max_list_len = max_list_len;
        self
    }

    /// Enables or disables parsing string scalars as JSON when they do not
    /// bind directly.
    pub fn with_lenient_scalars(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn max_list_len(&self) -> usize {
        self.max_list_len
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    pub fn flatten<T: ?Sized + Serialize>(&self, value: &T) -> Result<ArgumentBag, BindError> {
        self.flatten_at("", value)
    }

    pub fn flatten_at<T: ?Sized + Serialize>(
        &self,
        prefix: &str,
        value: &T,
    ) -> Result<ArgumentBag, BindError> {
        Flattener::new(self.max_depth).flatten(prefix, value)
    }

    pub fn unflatten<T: DeserializeOwned>(
        &self,
        bag: &ArgumentBag,
        prefix: &str,
    ) -> Result<T, BindError> {
        unflatten::unflatten(bag, prefix, self.lenient, self.max_list_len)
    }

    /// Binds a single bag value that is already at hand.
    pub fn coerce<T: DeserializeOwned>(&self, value: &Value, path: &str) -> Result<T, BindError> {
        unflatten::coerce(value, path, self.lenient)
    }

    /// Decodes a message payload into a bag.
    pub fn decode(&self, data: &[u8]) -> Result<ArgumentBag, BindError> {
        ArgumentBag::from_json_bytes(data)
    }

    /// Flattens `value` and encodes the bag as a message payload.
    pub fn encode<T: ?Sized + Serialize>(&self, value: &T) -> Result<Vec<u8>, BindError> {
        self.flatten(value)?.to_json_bytes()
    }
}
