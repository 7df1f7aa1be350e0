//! Dispatch engine.
//!
//! Every decoded message goes through
//! `Decoded → Resolved → (Dropped | Queued) → Running → (Replied | Void | Failed)`.
//! Resolution happens on the I/O side in [`Dispatcher::dispatch`]; the rest
//! runs on a pool worker in [`DispatchTask::run`]. Failures stop at this
//! boundary: they are logged and the client gets no reply.

use crate::error::ServerError;
use crate::registry::{HandlerRegistry, Route};
use crate::session::Session;
use crate::stats::{Outcome, ServerStats};
use crate::worker::WorkerPool;
use bytes::Bytes;
use gamewire_bind::{ArgumentBag, Arguments, BindError, Materializer};
use gamewire_protocol::{CommandCode, Message};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Result of handing a message to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No handler for the command code.
    Dropped,
    /// Queued for a worker.
    Queued,
    /// The pool refused the task (full or shutting down).
    Rejected,
}

/// Result of running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Replied,
    Void,
    Failed,
}

/// What a handler sees of the call it is serving.
pub struct Invocation<'a> {
    code: CommandCode,
    message: &'a Message,
    session: &'a Arc<Session>,
    args: Arguments<'a>,
    materializer: &'a Materializer,
}

impl<'a> Invocation<'a> {
    pub fn new(
        message: &'a Message,
        session: &'a Arc<Session>,
        args: Arguments<'a>,
        materializer: &'a Materializer,
    ) -> Self {
        Self {
            code: message.code(),
            message,
            session,
            args,
            materializer,
        }
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    /// The raw inbound message.
    pub fn message(&self) -> &Message {
        self.message
    }

    /// The session the message arrived on.
    pub fn session(&self) -> &Arc<Session> {
        self.session
    }

    /// Binds the declared parameter `name`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, BindError> {
        self.args.get(name)
    }

    /// The decoded argument bag.
    pub fn bag(&self) -> &ArgumentBag {
        self.args.bag()
    }

    pub fn materializer(&self) -> &Materializer {
        self.materializer
    }
}

/// One unit of work: a message, its resolved route and its session.
pub struct DispatchTask {
    route: Arc<Route>,
    session: Arc<Session>,
    message: Message,
    materializer: Arc<Materializer>,
    stats: Arc<ServerStats>,
}

impl DispatchTask {
    pub fn new(
        route: Arc<Route>,
        session: Arc<Session>,
        message: Message,
        materializer: Arc<Materializer>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            route,
            session,
            message,
            materializer,
            stats,
        }
    }

    /// Binds arguments, invokes the handler and sends the reply.
    pub fn run(self) -> TaskOutcome {
        let outcome = self.execute();
        self.stats.outcome(match outcome {
            TaskOutcome::Replied => Outcome::Replied,
            TaskOutcome::Void => Outcome::Void,
            TaskOutcome::Failed => Outcome::Failed,
        });
        outcome
    }

    fn execute(&self) -> TaskOutcome {
        let code = self.message.code();
        let materializer = self
            .session
            .materializer()
            .map(Arc::as_ref)
            .unwrap_or(self.materializer.as_ref());

        let bag = match materializer.decode(&self.message.data) {
            Ok(bag) => bag,
            Err(e) => {
                warn!(
                    session = %self.session.id(),
                    %code,
                    payload = %String::from_utf8_lossy(&self.message.data),
                    "undecodable arguments for {}: {}",
                    self.route.target(),
                    e
                );
                return TaskOutcome::Failed;
            }
        };

        let args = Arguments::new(&bag, self.route.parameters(), materializer);
        let invocation = Invocation::new(&self.message, &self.session, args, materializer);

        let started = Instant::now();
        let result = self.route.invoke(&invocation);
        self.stats
            .handler_duration(&code.to_string(), started.elapsed());

        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                trace!(%code, "{} completed without reply", self.route.target());
                return TaskOutcome::Void;
            }
            Err(e) if e.is_disconnect() => {
                debug!(session = %self.session.id(), "peer gone during {}: {}", self.route.target(), e);
                self.session.close();
                return TaskOutcome::Failed;
            }
            Err(e) => {
                warn!(
                    session = %self.session.id(),
                    %code,
                    bag = ?bag,
                    "{} failed: {}",
                    self.route.target(),
                    e
                );
                return TaskOutcome::Failed;
            }
        };

        let payload = match reply.to_json_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%code, "cannot encode reply of {}: {}", self.route.target(), e);
                return TaskOutcome::Failed;
            }
        };

        match self
            .session
            .send_message(&Message::new(code.master, code.slave, Bytes::from(payload)))
        {
            // A disconnect during the send closes the session without an error
            Ok(()) if self.session.is_closed() => {
                debug!(session = %self.session.id(), %code, "reply not delivered, session closed");
                TaskOutcome::Failed
            }
            Ok(()) => TaskOutcome::Replied,
            Err(e) => {
                warn!(session = %self.session.id(), %code, "reply failed: {}", e);
                TaskOutcome::Failed
            }
        }
    }
}

/// Resolves messages against the registry and feeds the worker pool.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    pool: Arc<WorkerPool>,
    materializer: Arc<Materializer>,
    stats: Arc<ServerStats>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        pool: Arc<WorkerPool>,
        materializer: Arc<Materializer>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            registry,
            pool,
            materializer,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Resolves `message` and queues it for a worker.
    pub fn dispatch(&self, session: &Arc<Session>, message: Message) -> DispatchState {
        let code = message.code();
        let Some(route) = self.registry.lookup(code) else {
            if message.is_heartbeat() {
                trace!(session = %session.id(), "heartbeat received");
            } else {
                warn!(session = %session.id(), %code, "no handler registered, dropping message");
            }
            self.stats.outcome(Outcome::Dropped);
            return DispatchState::Dropped;
        };

        let task = DispatchTask::new(
            route,
            Arc::clone(session),
            message,
            Arc::clone(&self.materializer),
            Arc::clone(&self.stats),
        );

        match self.pool.submit(Box::new(move || {
            task.run();
        })) {
            Ok(()) => DispatchState::Queued,
            Err(e) => {
                warn!(session = %session.id(), %code, "dispatch rejected: {}", e);
                self.stats.outcome(Outcome::Rejected);
                DispatchState::Rejected
            }
        }
    }
}
