//! Component lifecycle and supervision.
//!
//! Long-running parts of the server (worker pool, acceptors, pollers)
//! implement [`Lifecycle`] so a [`Supervisor`] can start them in order and
//! stop them in reverse. Failures are logged per component and folded into
//! an error flag; they never escape the supervisor.

use crate::error::ServerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// A startable, stoppable server component.
pub trait Lifecycle: Send + Sync {
    /// Component name for logs.
    fn name(&self) -> &str;

    fn initialize(&self) -> Result<(), ServerError> {
        Ok(())
    }

    fn start(&self) -> Result<(), ServerError>;

    fn stop(&self) -> Result<(), ServerError>;

    fn initialized(&self) -> bool;

    fn started(&self) -> bool;
}

/// Shared initialized/started flags for lifecycle implementors.
#[derive(Debug, Default)]
pub struct LifecycleState {
    initialized: AtomicBool,
    started: AtomicBool,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Marks the component started; returns false if it already was.
    pub fn mark_started(&self) -> bool {
        self.initialized.store(true, Ordering::SeqCst);
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Marks the component stopped; returns false if it was not running.
    pub fn mark_stopped(&self) -> bool {
        self.started.swap(false, Ordering::SeqCst)
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Sequences a set of components.
#[derive(Default)]
pub struct Supervisor {
    components: Vec<Arc<dyn Lifecycle>>,
    errors: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component; components start in insertion order.
    pub fn add(&mut self, component: Arc<dyn Lifecycle>) {
        self.components.push(component);
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn initialize_all(&self) {
        for component in &self.components {
            if component.initialized() {
                continue;
            }
            self.run(component.as_ref(), "initialize", |c| c.initialize());
        }
    }

    pub fn start_all(&self) {
        self.initialize_all();
        for component in &self.components {
            if component.started() {
                continue;
            }
            if self.run(component.as_ref(), "start", |c| c.start()) {
                info!("{} started", component.name());
            }
        }
    }

    pub fn stop_all(&self) {
        for component in self.components.iter().rev() {
            if !component.started() {
                continue;
            }
            if self.run(component.as_ref(), "stop", |c| c.stop()) {
                info!("{} stopped", component.name());
            }
        }
    }

    /// Returns whether any component failed a lifecycle step.
    pub fn has_errors(&self) -> bool {
        self.errors.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        component: &dyn Lifecycle,
        phase: &'static str,
        step: impl FnOnce(&dyn Lifecycle) -> Result<(), ServerError>,
    ) -> bool {
        match step(component) {
            Ok(()) => true,
            Err(e) => {
                let err = ServerError::Lifecycle {
                    component: component.name().to_string(),
                    phase,
                    message: e.to_string(),
                };
                error!("{}", err);
                self.errors.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}
