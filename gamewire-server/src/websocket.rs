//! Websocket listener.
//!
//! Clients exchange JSON text frames (see [`TextFrame`]). Inbound frames
//! must carry an MD5 `checkCode` of their `data`; outbound frames carry only
//! the codes and the payload. Binary frames are ignored.

use crate::context::ConnectionContext;
use crate::error::ServerError;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::session::{Session, TransportKind};
use crate::transport::{ChannelTransport, OutboundQueue};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gamewire_protocol::{Message, ProtocolError, TextFrame};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Websocket listener on a tokio runtime.
pub struct WebSocketAcceptor {
    addr: SocketAddr,
    context: Arc<ConnectionContext>,
    runtime: Handle,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: LifecycleState,
}

impl WebSocketAcceptor {
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Lifecycle for WebSocketAcceptor {
    fn name(&self) -> &str {
        "websocket acceptor"
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

        let task = self.runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(task);

        self.state.mark_started();
        info!("Websocket listener on {}", local_addr);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        if !self.state.mark_stopped() {
            return Ok(());
        }

        let _ = self.shutdown.send(());
        self.task.lock().take();
        info!("Websocket listener on {} stopped", self.addr);
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
                    let context = Arc::clone(&context);
                    let conn_shutdown = shutdown.subscribe();
                    tokio::spawn(async move {
                        let ws = match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                warn!("[{}] websocket handshake failed: {}", peer, e);
                                return;
                            }
                        };

                        let (transport, outbound) =
                            ChannelTransport::new(context.outbound_capacity());
                        let session = context.open(
                            TransportKind::WebSocket,
                            peer,
                            Box::new(transport),
                            permit,
                        );
                        serve_connection(ws, session, outbound, context, conn_shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("websocket accept loop shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    ws: WebSocketStream<TcpStream>,
    session: Arc<Session>,
    outbound: OutboundQueue,
    context: Arc<ConnectionContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let peer = session.remote_addr();
    let (sink, source) = ws.split();

    let closed = Arc::new(Notify::new());
    {
        let closed = Arc::clone(&closed);
        session.on_close(move |_| closed.notify_one());
    }

    let writer = tokio::spawn(write_loop(sink, outbound, peer));
    read_loop(source, &session, &context, &closed, &mut shutdown).await;

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
}

/// Validates one inbound text frame.
fn parse_text(text: &str) -> Result<Message, ProtocolError> {
    TextFrame::parse(text)?.into_message()
}

async fn read_loop(
    mut source: WsSource,
    session: &Arc<Session>,
    context: &ConnectionContext,
    closed: &Notify,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let peer = session.remote_addr();
    let heartbeat = context.heartbeat();

    loop {
        tokio::select! {
            _ = closed.notified() => return,
            _ = shutdown.recv() => {
                debug!("[{}] Shutdown signal received", peer);
                return;
            }
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match parse_text(&text) {
                    Ok(message) => {
                        session.mark_received();
                        context.on_message(session, message);
                    }
                    Err(e) => {
                        if context.on_protocol_error(session, &ServerError::Protocol(e)) {
                            return;
                        }
                    }
                },
                Some(Ok(WsMessage::Binary(data))) => {
                    debug!("[{}] ignoring binary frame of {} bytes", peer, data.len());
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("[{}] Connection closed by client", peer);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
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

async fn write_loop(mut sink: WsSink, mut outbound: OutboundQueue, peer: SocketAddr) {
    while let Some(message) = outbound.next().await {
        let text = match TextFrame::from_message(&message).and_then(|f| f.to_json()) {
            Ok(text) => text,
            Err(e) => {
                warn!("[{}] cannot encode {}: {}", peer, message.code(), e);
                continue;
            }
        };
        tokio::select! {
            _ = outbound.aborted() => break,
            result = sink.send(WsMessage::Text(text)) => {
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
    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!("[{}] close frame not sent: {}", peer, e);
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
    use crate::worker::WorkerPool;
    use gamewire_bind::{ArgumentBag, Materializer, ParamSpec};
    use md5::{Digest, Md5};
    use std::time::Duration;

    fn signed(master: i8, slave: i8, data: &str) -> String {
        let check = hex::encode(Md5::digest(data.as_bytes()));
        serde_json::json!({
            "masterCode": master,
            "slaveCode": slave,
            "data": data,
            "checkCode": check,
        })
        .to_string()
    }

    fn acceptor(max_protocol_errors: u32) -> (WebSocketAcceptor, Arc<WorkerPool>) {
        let mut registry = HandlerRegistry::new();
        registry
            .register_group(
                HandlerGroup::new("lobby", 1).route(
                    Route::call("greet", 2, |inv| {
                        let name: String = inv.arg("name")?;
                        Ok(format!("hello {name}"))
                    })
                    .param(ParamSpec::bag::<String>("name")),
                ),
            )
            .unwrap();

        let pool = Arc::new(WorkerPool::new(1, 16));
        pool.start().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            pool.clone(),
            Arc::new(Materializer::default()),
            Arc::new(ServerStats::new()),
        ));
        let context = Arc::new(ConnectionContext::new(
            dispatcher,
            Arc::new(ConnectionLimit::new(8)),
            Duration::ZERO,
            max_protocol_errors,
        ));
        let acceptor = WebSocketAcceptor::new(
            "127.0.0.1:0".parse().unwrap(),
            context,
            Handle::current(),
        );
        acceptor.start().unwrap();
        (acceptor, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_text_frame_round_trip() {
        let (acceptor, pool) = acceptor(3);
        let url = format!("ws://{}", acceptor.local_addr().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(WsMessage::Text(signed(1, 2, r#"{"name":"bob"}"#)))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = reply else {
            panic!("expected a text frame, got {reply:?}");
        };

        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["masterCode"], 1);
        assert_eq!(frame["slaveCode"], 2);
        assert!(frame.get("checkCode").is_none());

        let data = frame["data"].as_str().unwrap();
        let bag = ArgumentBag::from_json_bytes(data.as_bytes()).unwrap();
        assert_eq!(bag.get("").and_then(|v| v.as_str()), Some("hello bob"));

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_check_code_closes_after_budget() {
        let (acceptor, pool) = acceptor(2);
        let url = format!("ws://{}", acceptor.local_addr().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let tampered = serde_json::json!({
            "masterCode": 1,
            "slaveCode": 2,
            "data": r#"{"name":"eve"}"#,
            "checkCode": "00000000000000000000000000000000",
        })
        .to_string();
        ws.send(WsMessage::Text(tampered.clone())).await.unwrap();
        ws.send(WsMessage::Text(tampered)).await.unwrap();

        // No reply, only the close frame
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(Ok(WsMessage::Close(_))) | None | Some(Err(_))));

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_binary_frames_ignored() {
        let (acceptor, pool) = acceptor(1);
        let url = format!("ws://{}", acceptor.local_addr().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
        ws.send(WsMessage::Text(signed(1, 2, r#"{"name":"amy"}"#)))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(reply, WsMessage::Text(_)));

        acceptor.stop().unwrap();
        pool.stop().unwrap();
    }
}
