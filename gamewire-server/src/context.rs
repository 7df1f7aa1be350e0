//! State shared by every listener backend.

use crate::dispatch::{DispatchState, Dispatcher};
use crate::error::ServerError;
use crate::session::{Session, Transport, TransportKind};
use crate::stats::{ConnectionLimit, ConnectionPermit, ServerStats};
use gamewire_protocol::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default bound on a single blocking socket write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of replies queued for an async connection's writer.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Everything a listener needs to turn an accepted connection into a
/// dispatching session.
pub struct ConnectionContext {
    dispatcher: Arc<Dispatcher>,
    limit: Arc<ConnectionLimit>,
    heartbeat: Option<Duration>,
    max_protocol_errors: u32,
    write_timeout: Duration,
    outbound_capacity: usize,
}

impl ConnectionContext {
    /// A zero `heartbeat` disables idle heartbeats.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        limit: Arc<ConnectionLimit>,
        heartbeat: Duration,
        max_protocol_errors: u32,
    ) -> Self {
        Self {
            dispatcher,
            limit,
            heartbeat: (!heartbeat.is_zero()).then_some(heartbeat),
            max_protocol_errors: max_protocol_errors.max(1),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Bounds each blocking write. A peer that stays unwritable longer is
    /// disconnected.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.write_timeout = timeout;
        }
        self
    }

    /// Bounds the replies queued for an async writer. A connection whose
    /// queue is full is disconnected.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        self.dispatcher.stats()
    }

    pub fn limit(&self) -> &Arc<ConnectionLimit> {
        &self.limit
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Takes a connection slot for `peer`, logging when the server is full.
    pub fn admit(&self, peer: SocketAddr) -> Option<ConnectionPermit> {
        let permit = self.limit.try_acquire();
        if permit.is_none() {
            warn!(
                "Connection limit reached ({}), rejecting {}",
                self.limit.max(),
                peer
            );
        }
        permit
    }

    /// Wraps an accepted connection in a session. The permit is released
    /// when the session closes.
    pub fn open(
        &self,
        kind: TransportKind,
        peer: SocketAddr,
        transport: Box<dyn Transport>,
        permit: ConnectionPermit,
    ) -> Arc<Session> {
        let stats = Arc::clone(self.stats());
        let mut session = Session::new(kind, peer, transport)
            .with_materializer(Arc::clone(self.dispatcher.materializer()))
            .with_stats(Arc::clone(&stats));
        if let Some(interval) = self.heartbeat {
            session = session.with_heartbeat(interval);
        }

        stats.connection_opened(kind);
        session.on_close(move |_| {
            drop(permit);
            stats.connection_closed(kind);
        });

        info!("[{}] client connected over {}", peer, kind.label());
        Arc::new(session)
    }

    /// Hands a decoded message to the dispatcher.
    pub fn on_message(&self, session: &Arc<Session>, message: Message) -> DispatchState {
        session.reset_protocol_errors();
        self.dispatcher.dispatch(session, message)
    }

    /// Counts a protocol error against the session and closes it once the
    /// budget is spent. Returns whether the session was closed.
    pub fn on_protocol_error(&self, session: &Session, err: &ServerError) -> bool {
        warn!("[{}] protocol error: {}", session.remote_addr(), err);
        if session.record_protocol_error(self.max_protocol_errors) {
            warn!(
                "[{}] closing after {} consecutive protocol errors",
                session.remote_addr(),
                self.max_protocol_errors
            );
            session.close();
            return true;
        }
        false
    }
}
