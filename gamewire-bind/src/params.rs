//! Handler parameter descriptors and per-call argument resolution.

use crate::bag::ArgumentBag;
use crate::error::BindError;
use crate::materializer::Materializer;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::type_name;

/// Where a parameter's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// Materialized from the bag entries under the parameter's name.
    Bag,
    /// Materialized from the entire bag.
    Remaining,
    /// The inbound message itself.
    Message,
    /// The session the message arrived on.
    Session,
}

/// Declared shape of one handler parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    name: &'static str,
    source: ParamSource,
    type_name: &'static str,
}

impl ParamSpec {
    /// A parameter bound from the bag under `name`.
    pub fn bag<T: DeserializeOwned>(name: &'static str) -> Self {
        Self {
            name,
            source: ParamSource::Bag,
            type_name: type_name::<T>(),
        }
    }

    /// A catch-all parameter bound from the whole bag.
    pub fn remaining<T: DeserializeOwned>(name: &'static str) -> Self {
        Self {
            name,
            source: ParamSource::Remaining,
            type_name: type_name::<T>(),
        }
    }

    pub fn message(name: &'static str) -> Self {
        Self {
            name,
            source: ParamSource::Message,
            type_name: "message",
        }
    }

    pub fn session(name: &'static str) -> Self {
        Self {
            name,
            source: ParamSource::Session,
            type_name: "session",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> ParamSource {
        self.source
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns whether the dispatcher supplies this parameter directly.
    pub fn is_provided(&self) -> bool {
        matches!(self.source, ParamSource::Message | ParamSource::Session)
    }
}

/// Arguments of one call: the decoded bag seen through a handler's
/// parameter list.
pub struct Arguments<'a> {
    bag: &'a ArgumentBag,
    params: &'a [ParamSpec],
    materializer: &'a Materializer,
}

impl<'a> Arguments<'a> {
    pub fn new(bag: &'a ArgumentBag, params: &'a [ParamSpec], materializer: &'a Materializer) -> Self {
        Self {
            bag,
            params,
            materializer,
        }
    }

    pub fn bag(&self) -> &ArgumentBag {
        self.bag
    }

    pub fn params(&self) -> &[ParamSpec] {
        self.params
    }

    /// Raw bag entry at `path`.
    pub fn raw(&self, path: &str) -> Option<&Value> {
        self.bag.get(path)
    }

    /// Materializes the declared parameter `name` as a `T`.
    ///
    /// `T` must be the type the parameter was declared with.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, BindError> {
        let spec = self
            .params
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| BindError::UnknownParameter(name.to_string()))?;

        let requested = type_name::<T>();
        if !spec.is_provided() && spec.type_name != requested {
            return Err(BindError::TypeMismatch {
                name: name.to_string(),
                declared: spec.type_name,
                requested,
            });
        }

        match spec.source {
            ParamSource::Message | ParamSource::Session => {
                Err(BindError::ProvidedParameter(name.to_string()))
            }
            ParamSource::Remaining => self.materializer.unflatten(self.bag, ""),
            ParamSource::Bag => match self.bag.get(name) {
                Some(value) if !value.is_object() && !value.is_array() => {
                    self.materializer.coerce(value, name)
                }
                _ => self.materializer.unflatten(self.bag, name),
            },
        }
    }
}
