//! Connection management.

use crate::error::ClientError;
use futures_util::{SinkExt, StreamExt};
use gamewire_protocol::{Message, MessageCodec};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long [`crate::Client::call`] waits for a reply.
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A framed connection to a gamewire event-loop listener.
pub struct Connection {
    config: ConnectionConfig,
    framed: Framed<TcpStream, MessageCodec>,
}

impl Connection {
    /// Connects to the server.
    pub async fn open(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::ConnectTimeout
            })??;
        stream.set_nodelay(true)?;

        tracing::debug!("Connected to {}", config.addr);
        Ok(Self {
            config,
            framed: Framed::new(stream, MessageCodec::new()),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.framed.get_ref().local_addr()?)
    }

    /// Writes and flushes one message.
    pub async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Reads the next message, heartbeats included.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        match self.framed.next().await {
            Some(result) => Ok(result?),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Flushes and shuts down the write side.
    pub async fn close(mut self) -> Result<(), ClientError> {
        SinkExt::<Message>::close(&mut self.framed).await?;
        Ok(())
    }
}
