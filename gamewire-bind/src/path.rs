//! Argument path grammar.
//!
//! A path names one leaf of an argument bag:
//! - `a.b` is field `b` of record `a`
//! - `a[2]` is element 2 of list `a`
//! - `a.@.key` is entry `key` of map `a`
//!
//! Map keys may not contain `.` or `[`.

use crate::error::BindError;

/// Segment that marks the next segment as a map key.
pub const MAP_MARKER: &str = "@";

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
    MapKey(String),
}

/// Path of a record field under `prefix`.
pub fn field(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Path of a list element under `prefix`.
pub fn index(prefix: &str, index: usize) -> String {
    format!("{prefix}[{index}]")
}

/// Path of a map entry under `prefix`.
pub fn map_entry(prefix: &str, key: &str) -> String {
    field(&field(prefix, MAP_MARKER), key)
}

/// Returns whether `key` can be used as a map key segment.
pub fn valid_map_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['.', '['])
}

/// Strips `prefix` from `path`, returning the relative remainder.
///
/// The remainder is empty for an exact match, starts with `[` for list
/// elements, and is a plain relative path otherwise. Returns `None` when
/// `path` does not lie under `prefix` (`cardsX` is not under `cards`).
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('[') {
        Some(rest)
    } else {
        rest.strip_prefix('.')
    }
}

/// Parses a path into segments. The empty path has no segments.
pub fn parse(path: &str) -> Result<Vec<Segment>, BindError> {
    let malformed = || BindError::MalformedPath(path.to_string());

    let mut segments = Vec::new();
    let mut pending_map = false;
    let mut pos = 0;

    while pos < path.len() {
        let rest = &path[pos..];

        if let Some(after) = rest.strip_prefix('[') {
            if pending_map {
                return Err(malformed());
            }
            let close = after.find(']').ok_or_else(malformed)?;
            let index = after[..close].parse::<usize>().map_err(|_| malformed())?;
            segments.push(Segment::Index(index));
            pos += close + 2;
            continue;
        }

        if rest.starts_with('.') {
            if segments.is_empty() && !pending_map {
                return Err(malformed());
            }
            pos += 1;
            let next = &path[pos..];
            if next.is_empty() || next.starts_with(['.', '[']) {
                return Err(malformed());
            }
            continue;
        }

        // Names follow a dot or start the path
        if pos > 0 && !path[..pos].ends_with('.') {
            return Err(malformed());
        }

        let end = rest.find(['.', '[']).unwrap_or(rest.len());
        let name = &rest[..end];
        if pending_map {
            segments.push(Segment::MapKey(name.to_string()));
            pending_map = false;
        } else if name == MAP_MARKER {
            pending_map = true;
        } else {
            segments.push(Segment::Field(name.to_string()));
        }
        pos += end;
    }

    if pending_map {
        return Err(malformed());
    }
    Ok(segments)
}
