//! Handler registry.
//!
//! Handlers are registered once at startup as [`Route`]s, usually grouped
//! under a [`HandlerGroup`] that supplies the default master code. After
//! [`HandlerRegistry::seal`] the table is shared read-only behind an `Arc`.

use crate::dispatch::Invocation;
use crate::error::ServerError;
use gamewire_bind::{ArgumentBag, ParamSpec};
use gamewire_protocol::CommandCode;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Boxed handler body. Returns the reply bag, or `None` for void handlers.
pub type HandlerFn =
    dyn Fn(&Invocation<'_>) -> Result<Option<ArgumentBag>, ServerError> + Send + Sync;

/// One invocable handler target.
pub struct Route {
    method: &'static str,
    group: String,
    master: Option<i8>,
    slave: i8,
    thread_safe: bool,
    returns_value: bool,
    params: Vec<ParamSpec>,
    handler: Box<HandlerFn>,
    guard: Mutex<()>,
}

impl Route {
    /// A handler whose return value is flattened into the reply.
    pub fn call<T, F>(method: &'static str, slave: i8, handler: F) -> Self
    where
        T: Serialize,
        F: Fn(&Invocation<'_>) -> Result<T, ServerError> + Send + Sync + 'static,
    {
        Self::build(method, slave, true, move |invocation| {
            let value = handler(invocation)?;
            Ok(Some(invocation.materializer().flatten(&value)?))
        })
    }

    /// A handler that sends no reply.
    pub fn void<F>(method: &'static str, slave: i8, handler: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> Result<(), ServerError> + Send + Sync + 'static,
    {
        Self::build(method, slave, false, move |invocation| {
            handler(invocation)?;
            Ok(None)
        })
    }

    fn build<F>(method: &'static str, slave: i8, returns_value: bool, handler: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> Result<Option<ArgumentBag>, ServerError> + Send + Sync + 'static,
    {
        Self {
            method,
            group: String::new(),
            master: None,
            slave,
            thread_safe: false,
            returns_value,
            params: Vec::new(),
            handler: Box::new(handler),
            guard: Mutex::new(()),
        }
    }

    /// Overrides the group's master code for this route.
    pub fn master(mut self, master: i8) -> Self {
        self.master = Some(master);
        self
    }

    /// Marks the handler safe to run concurrently with itself.
    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Declares the next parameter.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn with_params(mut self, specs: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params.extend(specs);
        self
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Command code, once the master code is known.
    pub fn code(&self) -> Option<CommandCode> {
        self.master.map(|master| CommandCode::new(master, self.slave))
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    pub fn parameters(&self) -> &[ParamSpec] {
        &self.params
    }

    /// `group::method`, for logs.
    pub fn target(&self) -> String {
        if self.group.is_empty() {
            self.method.to_string()
        } else {
            format!("{}::{}", self.group, self.method)
        }
    }

    /// Runs the handler, holding the route's lock unless it is thread-safe.
    pub fn invoke(&self, invocation: &Invocation<'_>) -> Result<Option<ArgumentBag>, ServerError> {
        if self.thread_safe {
            (self.handler)(invocation)
        } else {
            let _guard = self.guard.lock();
            (self.handler)(invocation)
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("target", &self.target())
            .field("code", &self.code())
            .field("thread_safe", &self.thread_safe)
            .field("returns_value", &self.returns_value)
            .field("params", &self.params)
            .finish()
    }
}

/// Routes sharing a default master code.
pub struct HandlerGroup {
    name: String,
    master: i8,
    routes: Vec<Route>,
}

impl HandlerGroup {
    pub fn new(name: impl Into<String>, master: i8) -> Self {
        Self {
            name: name.into(),
            master,
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> i8 {
        self.master
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Two-level table from master code to slave code to route.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: BTreeMap<i8, BTreeMap<i8, Arc<Route>>>,
    sealed: bool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every route of `group`. Returns how many were added.
    pub fn register_group(&mut self, group: HandlerGroup) -> Result<usize, ServerError> {
        let HandlerGroup {
            name,
            master,
            routes,
        } = group;

        let count = routes.len();
        for mut route in routes {
            route.group = name.clone();
            route.master = Some(route.master.unwrap_or(master));
            self.register(route)?;
        }
        Ok(count)
    }

    /// Registers a single route. Routes outside a group must set their
    /// master code. Returns the route this one replaced, if any.
    pub fn register(&mut self, route: Route) -> Result<Option<Arc<Route>>, ServerError> {
        let Some(code) = route.code() else {
            return Err(ServerError::MissingMasterCode(route.target()));
        };
        if self.sealed {
            return Err(ServerError::RegistrySealed(code));
        }

        let route = Arc::new(route);

        let previous = self
            .routes
            .entry(code.master)
            .or_default()
            .insert(code.slave, Arc::clone(&route));

        match previous {
            Some(ref old) => warn!(
                "handler for {} overwritten: {} replaced by {}",
                code,
                old.target(),
                route.target()
            ),
            None => debug!("registered {} at {}", route.target(), code),
        }
        Ok(previous)
    }

    /// Stops accepting registrations.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Resolves a command code; `None` means no handler.
    pub fn lookup(&self, code: CommandCode) -> Option<Arc<Route>> {
        self.routes.get(&code.master)?.get(&code.slave).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All routes in `(master, slave)` order.
    pub fn iter(&self) -> impl Iterator<Item = (CommandCode, &Arc<Route>)> {
        self.routes.iter().flat_map(|(master, slaves)| {
            slaves
                .iter()
                .map(move |(slave, route)| (CommandCode::new(*master, *slave), route))
        })
    }
}
