//! Blocking-socket listener.
//!
//! [`SocketAcceptor`] accepts std `TcpStream`s and hands each new session
//! to a [`PollerGroup`]. Pollers cycle sessions through a shared queue:
//! take one, drain whatever it has buffered, put it back unless it closed.
//! Reads block for at most the configured read timeout, so one slow peer
//! only delays its poller by that slice.

use crate::context::ConnectionContext;
use crate::error::ServerError;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::session::{Session, TransportKind};
use crate::transport::BlockingTransport;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a poller waits for a session before rechecking shutdown.
const POLL_WAIT: Duration = Duration::from_millis(50);

/// Messages taken from one session before it goes back in the queue.
const MAX_BATCH: usize = 16;

/// Pause between accept attempts on an idle listener.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Threads that read blocking-socket sessions in turn.
pub struct PollerGroup {
    size: usize,
    context: Arc<ConnectionContext>,
    queue_tx: Sender<Arc<Session>>,
    queue_rx: Receiver<Arc<Session>>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: LifecycleState,
}

impl PollerGroup {
    pub fn new(size: usize, context: Arc<ConnectionContext>) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            size: size.max(1),
            context,
            queue_tx,
            queue_rx,
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            state: LifecycleState::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions waiting for a poller.
    pub fn pending(&self) -> usize {
        self.queue_rx.len()
    }

    /// Adds a session to the rotation.
    pub fn register(&self, session: Arc<Session>) -> Result<(), ServerError> {
        if !self.state.started() {
            session.close();
            return Err(ServerError::ShuttingDown);
        }
        self.queue_tx
            .send(session)
            .map_err(|_| ServerError::ShuttingDown)
    }

    fn spawn_poller(&self, index: usize) -> Result<JoinHandle<()>, ServerError> {
        let context = Arc::clone(&self.context);
        let queue_tx = self.queue_tx.clone();
        let queue_rx = self.queue_rx.clone();
        let running = Arc::clone(&self.running);

        let handle = std::thread::Builder::new()
            .name(format!("gamewire-poller-{index}"))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match queue_rx.recv_timeout(POLL_WAIT) {
                        Ok(session) => {
                            poll_session(&context, &session);
                            if !session.is_closed() && queue_tx.send(session).is_err() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("poller {} exiting", index);
            })?;
        Ok(handle)
    }
}

/// Drains up to [`MAX_BATCH`] messages from one session.
fn poll_session(context: &ConnectionContext, session: &Arc<Session>) {
    for _ in 0..MAX_BATCH {
        match session.receive_message() {
            Ok(Some(message)) => {
                context.on_message(session, message);
            }
            Ok(None) => return,
            Err(e @ ServerError::Protocol(_)) => {
                if context.on_protocol_error(session, &e) {
                    return;
                }
            }
            Err(e) => {
                warn!("[{}] read failed: {}", session.remote_addr(), e);
                session.close();
                return;
            }
        }
    }
}

impl Lifecycle for PollerGroup {
    fn name(&self) -> &str {
        "poller group"
    }

    fn initialize(&self) -> Result<(), ServerError> {
        self.state.mark_initialized();
        Ok(())
    }

    fn start(&self) -> Result<(), ServerError> {
        if self.state.started() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        let mut handles = self.handles.lock();
        for index in 0..self.size {
            handles.push(self.spawn_poller(index)?);
        }
        self.state.mark_started();
        info!("poller group started: {} threads", self.size);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        if !self.state.mark_stopped() {
            return Ok(());
        }

        self.running.store(false, Ordering::Release);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("poller thread panicked");
            }
        }

        for session in self.queue_rx.try_iter() {
            session.close();
        }
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.state.initialized()
    }

    fn started(&self) -> bool {
        self.state.started()
    }
}

/// Accept loop for the blocking-socket listener.
pub struct SocketAcceptor {
    addr: SocketAddr,
    read_timeout: Duration,
    context: Arc<ConnectionContext>,
    pollers: Arc<PollerGroup>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: LifecycleState,
}

impl SocketAcceptor {
    pub fn new(
        addr: SocketAddr,
        read_timeout: Duration,
        context: Arc<ConnectionContext>,
        pollers: Arc<PollerGroup>,
    ) -> Self {
        Self {
            addr,
            read_timeout,
            context,
            pollers,
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            state: LifecycleState::new(),
        }
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
    context: &ConnectionContext,
    pollers: &PollerGroup,
) {
    let Some(permit) = context.admit(peer) else {
        return;
    };

    // Accepted sockets must block; reads and writes are bounded by timeouts
    let write_timeout = context.write_timeout();
    let transport = match stream
        .set_nonblocking(false)
        .and_then(|_| BlockingTransport::new(stream, read_timeout, write_timeout))
    {
        Ok(transport) => transport,
        Err(e) => {
            warn!("[{}] failed to set up socket: {}", peer, e);
            return;
        }
    };

    let session = context.open(TransportKind::Socket, peer, Box::new(transport), permit);
    if let Err(e) = pollers.register(session) {
        debug!("[{}] session not registered: {}", peer, e);
    }
}

impl Lifecycle for SocketAcceptor {
    fn name(&self) -> &str {
        "socket acceptor"
    }

    fn initialize(&self) -> Result<(), ServerError> {
        self.state.mark_initialized();
        Ok(())
    }

    fn start(&self) -> Result<(), ServerError> {
        if self.state.started() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let context = Arc::clone(&self.context);
        let pollers = Arc::clone(&self.pollers);
        let read_timeout = self.read_timeout;

        let handle = std::thread::Builder::new()
            .name("gamewire-socket-acceptor".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            accept_connection(stream, peer, read_timeout, &context, &pollers);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_BACKOFF);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            std::thread::sleep(ACCEPT_BACKOFF);
                        }
                    }
                }
                debug!("socket acceptor exiting");
            })?;
        *self.handle.lock() = Some(handle);

        self.state.mark_started();
        info!("Socket listener on {}", local_addr);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        if !self.state.mark_stopped() {
            return Ok(());
        }

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("socket acceptor thread panicked");
            }
        }
        info!("Socket listener on {} stopped", self.addr);
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.state.initialized()
    }

    fn started(&self) -> bool {
        self.state.started()
    }
}
