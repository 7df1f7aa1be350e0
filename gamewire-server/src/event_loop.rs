//! Event-loop listener.
//!
//! Each connection gets a reader and a writer task on the tokio runtime.
//! The reader feeds the protocol decoder straight from the socket and
//! pushes every decoded message into the dispatcher; the writer drains the
//! session's outbound channel through a `FramedWrite`.

use crate::context::ConnectionContext;
use crate::error::ServerError;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::session::{Session, TransportKind};
use crate::transport::{decode_buffered, ChannelTransport, OutboundQueue};
use futures_util::SinkExt;
use gamewire_protocol::{Decoder, MessageCodec};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info};

/// Async TCP listener on a tokio runtime.
pub struct EventLoopAcceptor {
    addr: SocketAddr,
    context: Arc<ConnectionContext>,
    runtime: Handle,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: LifecycleState,
}

impl EventLoopAcceptor {
    pub fn new(addr: SocketAddr, context: Arc<ConnectionContext>, runtime: Handle) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            addr,
            context,
            runtime,
            local_addr: Mutex::new(None),
            shutdown,
            task: Mutex::new(None),
            state: LifecycleState::new(),
        }
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Lifecycle for EventLoopAcceptor {
    fn name(&self) -> &str {
        "event loop acceptor"
    }

    fn initialize(&self) -> Result<(), ServerError> {
        self.state.mark_initialized();
        Ok(())
    }

    fn start(&self) -> Result<(), ServerError> {
        if self.state.started() {
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(self.addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        *self.local_addr.lock() = Some(local_addr);

        let context = Arc::clone(&self.context);
        let shutdown = self.shutdown.clone();
        let task = self
            .runtime
            .spawn(accept_loop(listener, context, shutdown));
        *self.task.lock() = Some(task);

        self.state.mark_started();
        info!("Event loop listener on {}", local_addr);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        if !self.state.mark_stopped() {
            return Ok(());
        }

        // No receivers just means no live connections
        let _ = self.shutdown.send(());
        self.task.lock().take();
        info!("Event loop listener on {} stopped", self.addr);
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.state.initialized()
    }

    fn started(&self) -> bool {
        self.state.started()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let Some(permit) = context.admit(peer) else {
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[{}] set_nodelay failed: {}", peer, e);
                    }

                    let (transport, outbound) =
                        ChannelTransport::new(context.outbound_capacity());
                    let session = context.open(
                        TransportKind::EventLoop,
                        peer,
                        Box::new(transport),
                        permit,
                    );
                    let context = Arc::clone(&context);
                    let conn_shutdown = shutdown.subscribe();
                    tokio::spawn(async move {
                        serve_connection(stream, session, outbound, context, conn_shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("event loop accept loop shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    session: Arc<Session>,
    outbound: OutboundQueue,
    context: Arc<ConnectionContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let peer = session.remote_addr();
    let (read_half, write_half) = stream.into_split();

    let closed = Arc::new(Notify::new());
    {
        let closed = Arc::clone(&closed);
        session.on_close(move |_| closed.notify_one());
    }

    let writer = tokio::spawn(write_loop(write_half, outbound, peer));
    read_loop(read_half, &session, &context, &closed, &mut shutdown).await;

    session.close();
    let abort = writer.abort_handle();
    match tokio::time::timeout(context.write_timeout(), writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[{}] writer task ended abnormally: {}", peer, e),
        Err(_) => {
            debug!("[{}] writer did not drain in time", peer);
            abort.abort();
        }
    }
    debug!("[{}] connection task finished", peer);
}

async fn read_loop<R>(
    mut reader: R,
    session: &Arc<Session>,
    context: &ConnectionContext,
    closed: &Notify,
    shutdown: &mut broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let peer = session.remote_addr();
    let heartbeat = context.heartbeat();
    let mut decoder = Decoder::new();

    loop {
        // Dispatch everything already buffered
        loop {
            match decode_buffered(&mut decoder) {
                Ok(Some(message)) => {
                    session.mark_received();
                    context.on_message(session, message);
                }
                Ok(None) => break,
                Err(e) => {
                    if context.on_protocol_error(session, &e) {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = closed.notified() => return,
            _ = shutdown.recv() => {
                debug!("[{}] Shutdown signal received", peer);
                return;
            }
            result = reader.read_buf(decoder.buffer_mut()) => match result {
                Ok(0) => {
                    debug!("[{}] Connection closed by client", peer);
                    return;
                }
                Ok(n) => {
                    debug!("[{}] Received {} bytes", peer, n);
                }
                Err(e) => {
                    debug!("[{}] Read error: {}", peer, e);
                    return;
                }
            },
            _ = tokio::time::sleep(heartbeat.unwrap_or_default()), if heartbeat.is_some() => {
                session.heartbeat_if_idle();
            }
        }
    }
}

async fn write_loop(write_half: OwnedWriteHalf, mut outbound: OutboundQueue, peer: SocketAddr) {
    let mut sink = FramedWrite::new(write_half, MessageCodec::new());
    while let Some(message) = outbound.next().await {
        tokio::select! {
            _ = outbound.aborted() => break,
            result = sink.send(message) => {
                if let Err(e) = result {
                    debug!("[{}] Write error: {}", peer, e);
                    break;
                }
            }
        }
    }
    if outbound.is_aborted() {
        debug!("[{}] writer aborted with replies pending", peer);
        return;
    }
    if let Err(e) = sink.close().await {
        debug!("[{}] close failed: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::registry::{HandlerGroup, HandlerRegistry, Route};
    use crate::stats::{ConnectionLimit, ServerStats};
    use crate::transport::testing::MemoryTransport;
    use crate::worker::WorkerPool;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use gamewire_bind::{ArgumentBag, Materializer, ParamSpec};
    use gamewire_protocol::{frame, Message};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn acceptor(heartbeat: Duration) -> (EventLoopAcceptor, Arc<WorkerPool>, Arc<ServerStats>) {
        let mut registry = HandlerRegistry::new();
        registry
            .register_group(
                HandlerGroup::new("math", 2).route(
                    Route::call("add", 1, |inv| {
                        let a: i64 = inv.arg("a")?;
                        let b: i64 = inv.arg("b")?;
                        Ok(a + b)
                    })
                    .param(ParamSpec::bag::<i64>("a"))
                    .param(ParamSpec::bag::<i64>("b")),
                ),
            )
            .unwrap();

        let pool = Arc::new(WorkerPool::new(2, 64));
        pool.start().unwrap();
        let stats = Arc::new(ServerStats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            pool.clone(),
            Arc::new(Materializer::default()),
            stats.clone(),
        ));
        let context = Arc::new(ConnectionContext::new(
            dispatcher,
            Arc::new(ConnectionLimit::new(16)),
            heartbeat,
            3,
        ));
        let acceptor = EventLoopAcceptor::new(
            "127.0.0.1:0".parse().unwrap(),
            context,
            Handle::current(),
        );
        acceptor.start().unwrap();
        (acceptor, pool, stats)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_reply() {
        let (acceptor, pool, _) = acceptor(Duration::ZERO);
        let stream = TcpStream::connect(acceptor.local_addr().unwrap()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut replies = FramedRead::new(read_half, MessageCodec::new());

        // Two frames in a single write
        let mut bytes = frame::encode(&Message::new(2, 1, Bytes::from(r#"{"a":1,"b":2}"#))).unwrap();
        bytes.extend_from_slice(
            &frame::encode(&Message::new(2, 1, Bytes::from(r#"{"a":"40","b":2}"#))).unwrap(),
        );
        write_half.write_all(&bytes).await.unwrap();

        let mut sums = Vec::new();
        for _ in 0..2 {
            let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let bag = ArgumentBag::from_json_bytes(&reply.data).unwrap();
            sums.push(bag.get("").and_then(|v| v.as_i64()).unwrap());
        }
        sums.sort();
        assert_eq!(sums, vec![3, 42]);

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_heartbeat() {
        let (acceptor, pool, stats) = acceptor(Duration::from_millis(100));
        let stream = TcpStream::connect(acceptor.local_addr().unwrap()).await.unwrap();
        let mut frames = FramedRead::new(stream, MessageCodec::new());

        let message = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(message.is_heartbeat());
        assert!(stats.snapshot().heartbeats_sent >= 1);

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_loop_survives_garbage() {
        let (acceptor, pool, stats) = acceptor(Duration::ZERO);
        let context = acceptor.context.clone();

        let transport = MemoryTransport::new();
        let peer = "127.0.0.1:6000".parse().unwrap();
        let session = context.open(
            TransportKind::EventLoop,
            peer,
            Box::new(transport.clone()),
            context.admit(peer).unwrap(),
        );

        let request = frame::encode(&Message::new(2, 1, Bytes::from(r#"{"a":20,"b":22}"#))).unwrap();
        let garbage = [0u8; 12];
        let mut partial = request.clone();
        let tail = partial.split_off(5);
        let mock = tokio_test::io::Builder::new()
            .read(&request)
            .read(&garbage)
            .read(&partial)
            .read(&tail)
            .build();

        let closed = Notify::new();
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        read_loop(mock, &session, &context, &closed, &mut shutdown_rx).await;

        for _ in 0..100 {
            if transport.sent().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.sent().len(), 2);
        assert!(!session.is_closed());
        assert_eq!(stats.snapshot().protocol_errors, 1);
        assert_eq!(stats.snapshot().messages_received, 2);

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_releases_session() {
        let (acceptor, pool, stats) = acceptor(Duration::ZERO);
        let stream = TcpStream::connect(acceptor.local_addr().unwrap()).await.unwrap();

        for _ in 0..100 {
            if stats.snapshot().connections_active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(stream);

        for _ in 0..100 {
            if stats.snapshot().connections_active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().connections_active, 0);
        assert_eq!(stats.snapshot().connections_total, 1);

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }
}
