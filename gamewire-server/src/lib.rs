//! # gamewire-server
//!
//! Socket server for gamewire.
//!
//! This crate provides:
//! - A handler registry keyed by `(master, slave)` command codes
//! - Sessions over three listener backends: blocking sockets driven by a
//!   poller group, an async event loop, and websockets with JSON text frames
//! - A dispatch engine that binds arguments and runs handlers on a
//!   bounded worker pool
//! - Idle heartbeats, connection limits and protocol error budgets
//! - YAML configuration with environment overrides
//! - Optional Prometheus metrics

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod lifecycle;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod websocket;
pub mod worker;

pub use config::{BindConfig, Config, ConfigError, MetricsConfig, NetworkConfig, WorkerConfig};
pub use context::ConnectionContext;
pub use dispatch::{DispatchState, DispatchTask, Dispatcher, Invocation, TaskOutcome};
pub use error::ServerError;
pub use event_loop::EventLoopAcceptor;
pub use lifecycle::{Lifecycle, Supervisor};
pub use metrics::Metrics;
pub use poller::{PollerGroup, SocketAcceptor};
pub use registry::{HandlerGroup, HandlerRegistry, Route};
pub use server::Server;
pub use session::{Session, Transport, TransportKind};
pub use stats::{ServerStats, StatsSnapshot};
pub use transport::{BlockingTransport, ChannelTransport, Outbound, OutboundQueue};
pub use websocket::WebSocketAcceptor;
pub use worker::WorkerPool;
