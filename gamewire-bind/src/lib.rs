//! # gamewire-bind
//!
//! Argument materializer for gamewire.
//!
//! Converts between flat, path-keyed argument bags and typed values:
//! - [`flatten`]: any `Serialize` value into an [`ArgumentBag`]
//!   (`a.b`, `a[0]`, `a.@.key` paths), rejecting self-referencing graphs
//! - [`unflatten`]: a bag (or a prefix of it) into any `Deserialize` type,
//!   through an intermediate JSON value tree
//! - [`params`]: parameter descriptors and per-call argument resolution

pub mod bag;
pub mod error;
pub mod flatten;
pub mod materializer;
pub mod params;
pub mod path;
pub mod unflatten;

pub use bag::ArgumentBag;
pub use error::BindError;
pub use flatten::{to_bag, to_bag_at};
pub use materializer::Materializer;
pub use params::{Arguments, ParamSource, ParamSpec};
pub use unflatten::from_bag;

/// Default nesting limit for flattening.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Default upper bound on a list index when rebuilding a bag into a tree.
pub const DEFAULT_MAX_LIST_LEN: usize = 4096;
