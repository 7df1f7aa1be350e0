//! Server facade.
//!
//! [`Server`] wires a sealed [`HandlerRegistry`] to the worker pool and to
//! whichever listeners the [`Config`] enables, and runs them under a
//! [`Supervisor`].

use crate::config::Config;
use crate::context::ConnectionContext;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::event_loop::EventLoopAcceptor;
use crate::lifecycle::{Lifecycle, Supervisor};
use crate::metrics::{run_metrics_server, Metrics};
use crate::poller::{PollerGroup, SocketAcceptor};
use crate::registry::HandlerRegistry;
use crate::stats::{ConnectionLimit, ServerStats, StatsSnapshot};
use crate::websocket::WebSocketAcceptor;
use crate::worker::WorkerPool;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tracing::{error, info};

/// A configured gamewire server.
pub struct Server {
    config: Config,
    registry: Arc<HandlerRegistry>,
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
    pool: Arc<WorkerPool>,
    socket: Option<Arc<SocketAcceptor>>,
    event_loop: Option<Arc<EventLoopAcceptor>>,
    websocket: Option<Arc<WebSocketAcceptor>>,
    supervisor: Supervisor,
    handle: Option<Handle>,
    runtime: Option<Runtime>,
    metrics_shutdown: Mutex<Option<broadcast::Sender<()>>>,
    running: AtomicBool,
}

impl Server {
    /// Builds a server. Async listeners run on the ambient tokio runtime
    /// when there is one, otherwise on a runtime owned by the server.
    pub fn new(config: Config, registry: HandlerRegistry) -> Result<Self, ServerError> {
        let (handle, runtime) = if needs_runtime(&config) {
            match Handle::try_current() {
                Ok(handle) => (Some(handle), None),
                Err(_) => {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .enable_all()
                        .thread_name("gamewire-io")
                        .build()?;
                    (Some(runtime.handle().clone()), Some(runtime))
                }
            }
        } else {
            (None, None)
        };
        Self::build(config, registry, handle, runtime)
    }

    /// Builds a server whose async listeners run on `handle`.
    pub fn with_runtime(
        config: Config,
        registry: HandlerRegistry,
        handle: Handle,
    ) -> Result<Self, ServerError> {
        Self::build(config, registry, Some(handle), None)
    }

    fn build(
        config: Config,
        mut registry: HandlerRegistry,
        handle: Option<Handle>,
        runtime: Option<Runtime>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        registry.seal();
        let registry = Arc::new(registry);

        let metrics = if config.metrics.enabled {
            Some(Arc::new(Metrics::new()?))
        } else {
            None
        };
        let stats = Arc::new(match metrics {
            Some(ref metrics) => ServerStats::with_metrics(Arc::clone(metrics)),
            None => ServerStats::new(),
        });

        let pool = Arc::new(WorkerPool::new(
            config.workers.effective_pool_size(),
            config.workers.queue_capacity,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::new(config.bind.materializer()),
            Arc::clone(&stats),
        ));

        let net = &config.network;
        let context = || {
            Arc::new(
                ConnectionContext::new(
                    Arc::clone(&dispatcher),
                    Arc::new(ConnectionLimit::new(net.max_connections)),
                    net.idle_heartbeat(),
                    net.max_protocol_errors,
                )
                .with_write_timeout(net.write_timeout())
                .with_outbound_capacity(net.outbound_queue_capacity),
            )
        };

        let mut supervisor = Supervisor::new();
        supervisor.add(pool.clone());

        let socket = match net.socket_addr {
            Some(addr) => {
                let context = context();
                let pollers = Arc::new(PollerGroup::new(config.workers.pollers, context.clone()));
                let acceptor = Arc::new(SocketAcceptor::new(
                    addr,
                    net.read_timeout(),
                    context,
                    pollers.clone(),
                ));
                supervisor.add(pollers);
                supervisor.add(acceptor.clone());
                Some(acceptor)
            }
            None => None,
        };

        let event_loop = match (net.tcp_addr, handle.as_ref()) {
            (Some(addr), Some(handle)) => {
                let acceptor = Arc::new(EventLoopAcceptor::new(addr, context(), handle.clone()));
                supervisor.add(acceptor.clone());
                Some(acceptor)
            }
            _ => None,
        };

        let websocket = match (net.websocket_addr, handle.as_ref()) {
            (Some(addr), Some(handle)) => {
                let acceptor = Arc::new(WebSocketAcceptor::new(addr, context(), handle.clone()));
                supervisor.add(acceptor.clone());
                Some(acceptor)
            }
            _ => None,
        };

        Ok(Self {
            config,
            registry,
            stats,
            metrics,
            pool,
            socket,
            event_loop,
            websocket,
            supervisor,
            handle,
            runtime,
            metrics_shutdown: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Starts the worker pool and every listener. If any component fails,
    /// the ones already running are stopped again.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.supervisor.start_all();
        if self.supervisor.has_errors() {
            self.supervisor.stop_all();
            self.running.store(false, Ordering::SeqCst);
            return Err(ServerError::Lifecycle {
                component: "server".to_string(),
                phase: "start",
                message: "one or more components failed, see log".to_string(),
            });
        }

        self.start_metrics();
        info!(
            "gamewire server started: {} handlers, {} workers",
            self.registry.len(),
            self.pool.size()
        );
        Ok(())
    }

    fn start_metrics(&self) {
        let (Some(metrics), Some(handle)) = (self.metrics.as_ref(), self.handle.as_ref()) else {
            return;
        };

        let (tx, rx) = broadcast::channel(1);
        let addr = self.config.metrics.bind_addr;
        let metrics = Arc::clone(metrics);
        handle.spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, rx).await {
                error!("Metrics server error: {}", e);
            }
        });
        *self.metrics_shutdown.lock() = Some(tx);
    }

    /// Stops listeners, pollers and workers in reverse start order.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.metrics_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.supervisor.stop_all();
        info!("gamewire server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Bound address of the blocking-socket listener.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|a| a.local_addr())
    }

    /// Bound address of the event-loop listener.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.event_loop.as_ref().and_then(|a| a.local_addr())
    }

    /// Bound address of the websocket listener.
    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.websocket.as_ref().and_then(|a| a.local_addr())
    }
}

impl Lifecycle for Server {
    fn name(&self) -> &str {
        "server"
    }

    fn start(&self) -> Result<(), ServerError> {
        Server::start(self)
    }

    fn stop(&self) -> Result<(), ServerError> {
        Server::stop(self);
        Ok(())
    }

    /// A server is initialized once built.
    fn initialized(&self) -> bool {
        true
    }

    fn started(&self) -> bool {
        self.is_running()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn needs_runtime(config: &Config) -> bool {
    config.network.tcp_addr.is_some()
        || config.network.websocket_addr.is_some()
        || config.metrics.enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerGroup, Route};
    use crate::session::Session;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use gamewire_bind::{ArgumentBag, ParamSpec};
    use gamewire_client::Client;
    use gamewire_protocol::{frame, CommandCode, Decoder, Message, TextFrame};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct Card {
        code: i32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entered {
        code: i32,
        name: String,
        cards: Vec<Card>,
        remote: String,
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_group(
                HandlerGroup::new("lobby", 1)
                    .route(
                        Route::call("enter", 1, |inv| {
                            let session: &Arc<Session> = inv.session();
                            let mut cards: Vec<Card> =
                                inv.arg::<HashSet<Card>>("cards")?.into_iter().collect();
                            cards.sort_by_key(|c| c.code);
                            Ok(Entered {
                                code: inv.arg("code")?,
                                name: inv.arg("name")?,
                                cards,
                                remote: session.remote_addr().ip().to_string(),
                            })
                        })
                        .param(ParamSpec::session("session"))
                        .param(ParamSpec::bag::<i32>("code"))
                        .param(ParamSpec::bag::<String>("name"))
                        .param(ParamSpec::bag::<HashSet<Card>>("cards")),
                    )
                    .route(Route::void("noop", 2, |_| Ok(())).thread_safe(true)),
            )
            .unwrap();
        registry
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.network.socket_addr = Some("127.0.0.1:0".parse().unwrap());
        config.network.tcp_addr = Some("127.0.0.1:0".parse().unwrap());
        config.network.websocket_addr = Some("127.0.0.1:0".parse().unwrap());
        config.network.idle_heartbeat_secs = 1;
        config.workers.pool_size = 2;
        config.workers.pollers = 1;
        config
    }

    const ENTER: &str = r#"{"code":1,"name":"x","cards[0].code":2,"cards[1].code":5}"#;

    fn assert_entered(data: &[u8]) {
        let bag = ArgumentBag::from_json_bytes(data).unwrap();
        assert_eq!(bag.get("code").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(bag.get("name").and_then(|v| v.as_str()), Some("x"));
        assert_eq!(bag.get("cards[0].code").and_then(|v| v.as_i64()), Some(2));
        assert_eq!(bag.get("cards[1].code").and_then(|v| v.as_i64()), Some(5));
        assert_eq!(bag.get("remote").and_then(|v| v.as_str()), Some("127.0.0.1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_event_loop_with_client() {
        let server = Server::new(config(), registry()).unwrap();
        server.start().unwrap();
        assert!(server.registry().is_sealed());

        let mut client = Client::connect(server.tcp_addr().unwrap()).await.unwrap();
        let reply = client
            .call_raw(CommandCode::new(1, 1), Bytes::from(ENTER))
            .await
            .unwrap();
        assert_entered(&reply.data);

        // Unknown codes produce no reply; the next call still works
        client
            .send(Message::new(9, 9, Bytes::from("{}")))
            .await
            .unwrap();
        let reply = client
            .call_raw(CommandCode::new(1, 1), Bytes::from(ENTER))
            .await
            .unwrap();
        assert_eq!(reply.code(), CommandCode::new(1, 1));

        server.stop();
        assert!(server.stats().dropped >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_socket_end_to_end() {
        let server = Server::new(config(), registry()).unwrap();
        server.start().unwrap();
        let addr = server.socket_addr().unwrap();

        let data = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let request = Message::new(1, 1, Bytes::from(ENTER));
            stream.write_all(&frame::encode(&request).unwrap()).unwrap();

            let mut decoder = Decoder::new();
            let mut buf = [0u8; 1024];
            loop {
                if let Some(message) = decoder.decode().unwrap() {
                    if !message.is_heartbeat() {
                        return message.data;
                    }
                    continue;
                }
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0);
                decoder.extend(&buf[..n]);
            }
        })
        .await
        .unwrap();
        assert_entered(&data);

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_websocket_end_to_end() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let server = Server::new(config(), registry()).unwrap();
        server.start().unwrap();

        let url = format!("ws://{}", server.websocket_addr().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let request = TextFrame::signed(1, 1, ENTER).to_json().unwrap();
        ws.send(WsMessage::Text(request)).await.unwrap();

        let text = loop {
            let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = next {
                let frame = TextFrame::parse(&text).unwrap();
                if frame.data.as_deref() != Some("") {
                    break text;
                }
            }
        };
        let frame = TextFrame::parse(&text).unwrap();
        assert_eq!(frame.master_code, Some(1));
        assert_eq!(frame.slave_code, Some(1));
        assert_entered(frame.data.unwrap().as_bytes());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_connection_gets_heartbeat() {
        let server = Server::new(config(), registry()).unwrap();
        server.start().unwrap();

        let mut client = Client::connect(server.tcp_addr().unwrap()).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), client.recv_any())
            .await
            .unwrap()
            .unwrap();
        assert!(message.is_heartbeat());
        assert!(server.stats().heartbeats_sent >= 1);

        server.stop();
    }

    #[test]
    fn test_server_without_runtime_owns_one() {
        let server = Server::new(config(), registry()).unwrap();
        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.tcp_addr().is_some());
        assert!(server.socket_addr().is_some());
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.network.socket_addr = None;
        config.network.tcp_addr = None;
        config.network.websocket_addr = None;
        assert!(matches!(
            Server::new(config, registry()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config();
        config.network.tcp_addr = None;
        config.network.websocket_addr = None;
        config.network.socket_addr = Some(occupied.local_addr().unwrap());

        let server = Server::new(config, registry()).unwrap();
        assert!(matches!(
            server.start(),
            Err(ServerError::Lifecycle { .. })
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn test_server_under_supervisor() {
        let mut config = config();
        config.network.tcp_addr = None;
        config.network.websocket_addr = None;
        let server = Arc::new(Server::new(config, registry()).unwrap());

        let mut supervisor = Supervisor::new();
        supervisor.add(server.clone());
        supervisor.start_all();
        assert!(!supervisor.has_errors());
        assert!(Lifecycle::started(server.as_ref()));

        supervisor.stop_all();
        assert!(!server.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_off_and_list_cap() {
        let mut config = config();
        config.network.idle_heartbeat_secs = 0;
        config.bind.max_list_len = 4;
        let server = Server::new(config, registry()).unwrap();
        server.start().unwrap();

        let mut client = Client::connect(server.tcp_addr().unwrap()).await.unwrap();
        let oversized = r#"{"code":1,"name":"x","cards[1000000000000].code":2}"#;
        client
            .send(Message::new(1, 1, Bytes::from(oversized)))
            .await
            .unwrap();
        let reply = client
            .call_raw(CommandCode::new(1, 1), Bytes::from(ENTER))
            .await
            .unwrap();
        assert_entered(&reply.data);

        for _ in 0..100 {
            if server.stats().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = server.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.heartbeats_sent, 0);
        server.stop();
    }
}
