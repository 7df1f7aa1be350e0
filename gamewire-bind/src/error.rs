//! Binding error types.

use thiserror::Error;

/// Errors raised while flattening values or binding arguments.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("self reference detected at '{path}'")]
    SelfReference { path: String },

    #[error("nesting deeper than {max} levels at '{path}'")]
    DepthExceeded { path: String, max: usize },

    #[error("unsupported map key at '{path}': {reason}")]
    MapKey { path: String, reason: String },

    #[error("malformed path '{0}'")]
    MalformedPath(String),

    #[error("conflicting entries at '{0}'")]
    PathConflict(String),

    #[error("list index {index} at '{path}' exceeds the limit of {max} elements")]
    ListTooLong {
        path: String,
        index: usize,
        max: usize,
    },

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("type mismatch for '{name}': declared {declared}, requested {requested}")]
    TypeMismatch {
        name: String,
        declared: &'static str,
        requested: &'static str,
    },

    #[error("parameter '{0}' is supplied by the dispatcher, not the argument bag")]
    ProvidedParameter(String),

    #[error("cannot bind '{path}': {source}")]
    Deserialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for BindError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        BindError::Custom(msg.to_string())
    }
}
