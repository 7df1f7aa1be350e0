//! High-level client API.
//!
//! The wire protocol has no request ids: a reply is the next message that
//! carries the request's command code. Anything else that arrives while a
//! call is waiting is kept for [`Client::recv`].

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use gamewire_bind::{ArgumentBag, Materializer};
use gamewire_protocol::{CommandCode, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Client for the event-loop listener.
pub struct Client {
    conn: Connection,
    materializer: Materializer,
    inbox: VecDeque<Message>,
}

impl Client {
    /// Connects with default timeouts.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with(ConnectionConfig::new(addr)).await
    }

    pub async fn connect_with(config: ConnectionConfig) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::open(config).await?,
            materializer: Materializer::default(),
            inbox: VecDeque::new(),
        })
    }

    /// Replaces the materializer used to encode arguments and decode replies.
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Sends a raw message.
    pub async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        self.conn.send(message).await
    }

    /// Flattens `args` and sends them under `code` without waiting.
    pub async fn send_value<T: ?Sized + Serialize>(
        &mut self,
        code: CommandCode,
        args: &T,
    ) -> Result<(), ClientError> {
        let payload = self.materializer.encode(args)?;
        self.send(Message::with_code(code, payload)).await
    }

    /// Returns the next message, heartbeats included.
    pub async fn recv_any(&mut self) -> Result<Message, ClientError> {
        match self.inbox.pop_front() {
            Some(message) => Ok(message),
            None => self.conn.recv().await,
        }
    }

    /// Returns the next message that is not a heartbeat.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            let message = self.recv_any().await?;
            if !message.is_heartbeat() {
                return Ok(message);
            }
        }
    }

    /// Sends a raw payload and waits for the reply under the same code.
    pub async fn call_raw(
        &mut self,
        code: CommandCode,
        data: impl Into<Bytes>,
    ) -> Result<Message, ClientError> {
        self.send(Message::with_code(code, data)).await?;

        let timeout = self.conn.config().request_timeout;
        tokio::time::timeout(timeout, self.await_reply(code))
            .await
            .map_err(|_| ClientError::Timeout(code))?
    }

    async fn await_reply(&mut self, code: CommandCode) -> Result<Message, ClientError> {
        loop {
            let message = self.conn.recv().await?;
            if message.is_heartbeat() {
                continue;
            }
            if message.code() == code {
                return Ok(message);
            }
            tracing::debug!("holding {} while waiting for {}", message.code(), code);
            self.inbox.push_back(message);
        }
    }

    /// Calls a handler with flattened `args` and returns the reply bag.
    pub async fn call<T: ?Sized + Serialize>(
        &mut self,
        code: CommandCode,
        args: &T,
    ) -> Result<ArgumentBag, ClientError> {
        let payload = self.materializer.encode(args)?;
        let reply = self.call_raw(code, payload).await?;
        Ok(self.materializer.decode(&reply.data)?)
    }

    /// Like [`Client::call`], materializing the reply as `R`.
    pub async fn call_as<T, R>(&mut self, code: CommandCode, args: &T) -> Result<R, ClientError>
    where
        T: ?Sized + Serialize,
        R: DeserializeOwned,
    {
        let bag = self.call(code, args).await?;
        Ok(self.materializer.unflatten(&bag, "")?)
    }

    /// Closes the connection.
    pub async fn close(self) -> Result<(), ClientError> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use gamewire_protocol::MessageCodec;
    use serde::Deserialize;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Seat {
        table: u32,
        players: Vec<String>,
    }

    /// Replies to every message with its own payload, after an unrelated
    /// push and a heartbeat.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, MessageCodec::new());
            while let Some(Ok(message)) = framed.next().await {
                framed.send(Message::heartbeat()).await.unwrap();
                framed
                    .send(Message::new(7, 7, Bytes::from(r#"{"push":true}"#)))
                    .await
                    .unwrap();
                framed.send(message).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_call_skips_heartbeats_and_holds_pushes() {
        let addr = echo_server().await;
        let mut client = Client::connect(addr).await.unwrap();

        let seat = Seat {
            table: 3,
            players: vec!["a".into(), "b".into()],
        };
        let bag = client.call(CommandCode::new(1, 4), &seat).await.unwrap();
        assert_eq!(bag.get("table").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(bag.get("players[1]").and_then(|v| v.as_str()), Some("b"));

        // The push that arrived first is still available
        let push = client.recv().await.unwrap();
        assert_eq!(push.code(), CommandCode::new(7, 7));
    }

    #[tokio::test]
    async fn test_call_as_materializes_reply() {
        let addr = echo_server().await;
        let mut client = Client::connect(addr).await.unwrap();

        let seat = Seat {
            table: 9,
            players: vec!["z".into()],
        };
        let echoed: Seat = client.call_as(CommandCode::new(2, 1), &seat).await.unwrap();
        assert_eq!(echoed, seat);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = Client::connect(addr).await.unwrap();
        assert!(matches!(
            client.recv().await,
            Err(ClientError::ConnectionClosed) | Err(ClientError::Protocol(_))
        ));
    }
}
