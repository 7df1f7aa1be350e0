//! Materializing typed values from argument bags.

use crate::bag::ArgumentBag;
use crate::error::BindError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

/// Builds a `T` from the bag entries under `prefix`.
///
/// The empty prefix consumes the whole bag.
pub fn from_bag<T: DeserializeOwned>(bag: &ArgumentBag, prefix: &str) -> Result<T, BindError> {
    unflatten(bag, prefix, true, crate::DEFAULT_MAX_LIST_LEN)
}

pub(crate) fn unflatten<T: DeserializeOwned>(
    bag: &ArgumentBag,
    prefix: &str,
    lenient: bool,
    max_list_len: usize,
) -> Result<T, BindError> {
    let scoped = bag.scoped(prefix);
    if scoped.is_empty() {
        // Only types that accept null (Option, unit) bind to nothing
        return T::deserialize(&Value::Null)
            .map_err(|_| BindError::MissingArgument(prefix.to_string()));
    }

    let tree = scoped.to_tree_limited(max_list_len)?;
    coerce(&tree, prefix, lenient)
}

/// Deserializes one JSON value, optionally retrying a string scalar as JSON
/// text (`"5"` binds to an integer, `"true"` to a bool).
pub(crate) fn coerce<T: DeserializeOwned>(
    value: &Value,
    path: &str,
    lenient: bool,
) -> Result<T, BindError> {
    match T::deserialize(value) {
        Ok(v) => Ok(v),
        Err(source) => {
            if lenient {
                if let Value::String(text) = value {
                    if let Ok(v) = serde_json::from_str::<T>(text) {
                        trace!(path, "coerced string argument");
                        return Ok(v);
                    }
                }
            }
            Err(BindError::Deserialize {
                path: path.to_string(),
                source,
            })
        }
    }
}

/// Reads a value from its JSON tree form, for callers that already hold one.
pub fn from_tree<'de, T: Deserialize<'de>>(tree: &'de Value) -> Result<T, BindError> {
    Ok(T::deserialize(tree)?)
}
