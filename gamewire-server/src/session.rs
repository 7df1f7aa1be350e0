//! Connection sessions.
//!
//! A [`Session`] is the transport-agnostic view of one client connection.
//! The wire side lives behind a [`Transport`] backend (see
//! [`crate::transport`]); everything above it, from dispatch to handlers,
//! only sees the session.

use crate::config::ConfigError;
use crate::error::ServerError;
use crate::stats::ServerStats;
use bytes::Bytes;
use dashmap::DashMap;
use gamewire_bind::Materializer;
use gamewire_protocol::{CommandCode, Message};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which listener a session came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Blocking socket driven by the poller group.
    Socket,
    /// Async socket on the event loop.
    EventLoop,
    /// JSON text frames over a websocket.
    WebSocket,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::EventLoop => "event_loop",
            TransportKind::WebSocket => "websocket",
        }
    }
}

/// Wire backend of a session.
pub trait Transport: Send + Sync {
    /// Writes one message.
    fn send(&self, message: &Message) -> Result<(), ServerError>;

    /// Pulls one decoded message if one is available. Push-based backends
    /// never have anything to pull.
    fn receive(&self) -> Result<Option<Message>, ServerError> {
        Ok(None)
    }

    /// Releases the underlying connection.
    fn shutdown(&self);
}

type CloseCallback = Box<dyn FnOnce(&Session) + Send>;

/// One client connection.
pub struct Session {
    id: String,
    kind: TransportKind,
    remote_addr: SocketAddr,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    protocol_errors: AtomicU32,
    heartbeat: Option<Duration>,
    attributes: DashMap<String, Arc<dyn Any + Send + Sync>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    materializer: Option<Arc<Materializer>>,
    stats: Option<Arc<ServerStats>>,
    transport: Box<dyn Transport>,
}

impl Session {
    /// Creates a new session over `transport`.
    pub fn new(kind: TransportKind, remote_addr: SocketAddr, transport: Box<dyn Transport>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            remote_addr,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            protocol_errors: AtomicU32::new(0),
            heartbeat: None,
            attributes: DashMap::new(),
            close_callbacks: Mutex::new(Vec::new()),
            materializer: None,
            stats: None,
            transport,
        }
    }

    /// Sets the materializer used by [`Session::send_value`].
    pub fn with_materializer(mut self, materializer: Arc<Materializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Enables idle heartbeats.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn materializer(&self) -> Option<&Arc<Materializer>> {
        self.materializer.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the time since the last inbound message or heartbeat.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encodes and writes a message.
    ///
    /// Does nothing on a closed session. A write that fails because the
    /// peer is gone closes the session and is not reported as an error.
    pub fn send_message(&self, message: &Message) -> Result<(), ServerError> {
        if self.is_closed() {
            return Ok(());
        }
        match self.transport.send(message) {
            Ok(()) => Ok(()),
            Err(e) if e.is_disconnect() => {
                debug!("[{}] peer gone during send: {}", self.remote_addr, e);
                self.close();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Flattens `value` into an argument bag and sends it under `code`.
    pub fn send_value<T: ?Sized + Serialize>(
        &self,
        code: CommandCode,
        value: &T,
    ) -> Result<(), ServerError> {
        let materializer = self
            .materializer
            .as_ref()
            .ok_or(ConfigError::Missing("argument materializer"))?;
        let payload = materializer.encode(value)?;
        self.send_message(&Message::new(code.master, code.slave, Bytes::from(payload)))
    }

    /// Pulls one message from a pull-based transport.
    ///
    /// When nothing arrives for the heartbeat interval a single heartbeat
    /// is sent and the idle clock restarts. Disconnects close the session
    /// and yield `Ok(None)`.
    pub fn receive_message(&self) -> Result<Option<Message>, ServerError> {
        if self.is_closed() {
            return Ok(None);
        }
        match self.transport.receive() {
            Ok(Some(message)) => {
                self.mark_received();
                Ok(Some(message))
            }
            Ok(None) => {
                self.heartbeat_if_idle();
                Ok(None)
            }
            Err(e) if e.is_disconnect() => {
                debug!("[{}] peer gone during receive: {}", self.remote_addr, e);
                self.close();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Records one inbound message. Push-based readers call this for every
    /// frame they decode.
    pub fn mark_received(&self) {
        self.touch();
        if let Some(ref stats) = self.stats {
            stats.message_received(self.kind);
        }
    }

    /// Sends a heartbeat if the session has been idle for the heartbeat
    /// interval. Returns whether one was sent.
    pub fn heartbeat_if_idle(&self) -> bool {
        let Some(interval) = self.heartbeat else {
            return false;
        };
        if self.is_closed() || self.idle_duration() < interval {
            return false;
        }

        self.touch();
        match self.send_message(&Message::heartbeat()) {
            Ok(()) if !self.is_closed() => {
                debug!("[{}] heartbeat sent", self.remote_addr);
                if let Some(ref stats) = self.stats {
                    stats.heartbeat_sent();
                }
                true
            }
            Ok(()) => false,
            Err(e) => {
                warn!("[{}] heartbeat failed: {}", self.remote_addr, e);
                false
            }
        }
    }

    /// Counts a protocol error; returns true once `max` consecutive errors
    /// have been seen.
    pub fn record_protocol_error(&self, max: u32) -> bool {
        if let Some(ref stats) = self.stats {
            stats.protocol_error(self.kind);
        }
        self.protocol_errors.fetch_add(1, Ordering::AcqRel) + 1 >= max
    }

    pub fn reset_protocol_errors(&self) {
        self.protocol_errors.store(0, Ordering::Release);
    }

    /// Registers a callback to run when the session closes. Runs it at once
    /// if the session is already closed.
    pub fn on_close(&self, callback: impl FnOnce(&Session) + Send + 'static) {
        let mut callbacks = self.close_callbacks.lock();
        if self.is_closed() {
            drop(callbacks);
            callback(self);
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// Closes the session. Idempotent; callbacks run once, in registration
    /// order, before the transport is released.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.close_callbacks.lock());
        for callback in callbacks {
            callback(self);
        }
        self.transport.shutdown();
        info!("[{}] session {} closed", self.remote_addr, self.id);
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it exists and is a `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear_attributes(&self) {
        self.attributes.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
