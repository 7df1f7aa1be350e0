//! Transport backends.
//!
//! - [`BlockingTransport`]: a std `TcpStream` read in short timeout slices
//!   by the poller group.
//! - [`ChannelTransport`]: hands outbound messages to a writer task through
//!   a bounded [`OutboundQueue`]; used by the event-loop and websocket
//!   backends, whose readers push inbound messages straight into the
//!   dispatcher.
//!
//! Both backends report a peer that stops reading as
//! [`ServerError::SlowConsumer`], which closes the session.

use crate::error::ServerError;
use crate::session::Transport;
use gamewire_protocol::{frame, Decoder, Message};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

const READ_CHUNK: usize = 8192;

struct BlockingReader {
    stream: TcpStream,
    decoder: Decoder,
    scratch: Box<[u8]>,
}

/// Blocking-socket backend.
pub struct BlockingTransport {
    peer: SocketAddr,
    reader: Mutex<BlockingReader>,
    writer: Mutex<TcpStream>,
}

impl BlockingTransport {
    /// Wraps an accepted stream. Each receive blocks for at most
    /// `read_timeout`; each send for at most `write_timeout`.
    pub fn new(
        stream: TcpStream,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        Ok(Self {
            peer,
            reader: Mutex::new(BlockingReader {
                stream,
                decoder: Decoder::new(),
                scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            }),
            writer: Mutex::new(writer),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for BlockingTransport {
    fn send(&self, message: &Message) -> Result<(), ServerError> {
        let frame = frame::encode(message)?;
        let mut writer = self.writer.lock();
        let result = match writer.write_all(&frame) {
            Ok(()) => writer.flush(),
            Err(e) => Err(e),
        };
        result.map_err(|e| match e.kind() {
            // The peer's receive window stayed full for the whole timeout
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ServerError::SlowConsumer,
            _ => e.into(),
        })
    }

    fn receive(&self) -> Result<Option<Message>, ServerError> {
        let mut guard = self.reader.lock();
        let reader = &mut *guard;

        // A previous read may have buffered more than one frame
        if let Some(message) = decode_buffered(&mut reader.decoder)? {
            return Ok(Some(message));
        }

        match reader.stream.read(&mut reader.scratch) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => {
                reader.decoder.extend(&reader.scratch[..n]);
                decode_buffered(&mut reader.decoder)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            debug!("[{}] socket shutdown: {}", self.peer, e);
        }
    }
}

/// Decodes the next buffered frame, dropping the buffer when the frame
/// boundary is lost.
pub(crate) fn decode_buffered(decoder: &mut Decoder) -> Result<Option<Message>, ServerError> {
    if !decoder.has_minimum() {
        return Ok(None);
    }
    match decoder.decode() {
        Ok(message) => Ok(message),
        Err(e) => {
            if e.breaks_framing() {
                decoder.clear();
            }
            Err(e.into())
        }
    }
}

/// Work for a backend's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    Close,
}

/// Backend that forwards outbound traffic to a writer task.
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    abort: watch::Sender<bool>,
}

impl ChannelTransport {
    /// Creates the transport and the queue its writer task drains. At most
    /// `capacity` messages wait in the queue.
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (abort, abort_rx) = watch::channel(false);
        (
            Self { tx, abort },
            OutboundQueue {
                rx,
                abort: abort_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: &Message) -> Result<(), ServerError> {
        match self.tx.try_send(Outbound::Message(message.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ServerError::SlowConsumer),
            Err(TrySendError::Closed(_)) => Err(ServerError::SessionClosed),
        }
    }

    fn shutdown(&self) {
        match self.tx.try_send(Outbound::Close) {
            // The writer task may already be gone
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.abort.send_replace(true);
            }
        }
    }
}

/// Receiving end of a [`ChannelTransport`].
///
/// Queued messages are delivered until [`Outbound::Close`]. When the queue
/// was full at close time the writer is aborted instead, and pending
/// messages are dropped.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
    abort: watch::Receiver<bool>,
}

impl OutboundQueue {
    /// Next message to write, or `None` once the connection is closing.
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = wait_aborted(&mut self.abort) => None,
            item = self.rx.recv() => match item {
                Some(Outbound::Message(message)) => Some(message),
                Some(Outbound::Close) | None => None,
            },
        }
    }

    /// Resolves when the writer must stop without flushing.
    pub async fn aborted(&mut self) {
        wait_aborted(&mut self.abort).await
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }
}

async fn wait_aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        // Transport dropped without aborting; the queue ends on its own
        std::future::pending::<()>().await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, TransportKind};
    use bytes::Bytes;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn blocking(stream: TcpStream) -> BlockingTransport {
        BlockingTransport::new(stream, Duration::from_millis(5), Duration::from_secs(5)).unwrap()
    }

    fn receive_within(transport: &BlockingTransport, attempts: usize) -> Option<Message> {
        for _ in 0..attempts {
            if let Some(message) = transport.receive().unwrap() {
                return Some(message);
            }
        }
        None
    }

    #[test]
    fn test_blocking_receive_and_send() {
        let (mut client, server) = pair();
        let transport = blocking(server);

        // Nothing buffered yet
        assert!(transport.receive().unwrap().is_none());

        let request = Message::new(1, 1, Bytes::from(r#"{"code":1}"#));
        client.write_all(&frame::encode(&request).unwrap()).unwrap();
        assert_eq!(receive_within(&transport, 200), Some(request));

        transport.send(&Message::new(1, 1, Bytes::from("{}"))).unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x2B, 0x2B]);
    }

    #[test]
    fn test_blocking_receive_two_frames_one_read() {
        let (mut client, server) = pair();
        let transport = blocking(server);

        let mut bytes = frame::encode(&Message::new(1, 1, Bytes::from("a"))).unwrap();
        bytes.extend_from_slice(&frame::encode(&Message::new(1, 2, Bytes::from("b"))).unwrap());
        client.write_all(&bytes).unwrap();

        let first = receive_within(&transport, 200).unwrap();
        let second = receive_within(&transport, 200).unwrap();
        assert_eq!(first.slave_code, 1);
        assert_eq!(second.slave_code, 2);
    }

    #[test]
    fn test_blocking_bad_marker_clears_buffer() {
        let (mut client, server) = pair();
        let transport = blocking(server);

        client.write_all(&[0u8; 16]).unwrap();
        let mut error = None;
        for _ in 0..200 {
            match transport.receive() {
                Ok(None) => continue,
                Ok(Some(_)) => panic!("garbage decoded"),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(
            error,
            Some(ServerError::Protocol(ref e)) if e.breaks_framing()
        ));

        // The stream recovers on the next good frame
        let request = Message::new(2, 2, Bytes::from("ok"));
        client.write_all(&frame::encode(&request).unwrap()).unwrap();
        let mut recovered = None;
        for _ in 0..200 {
            if let Ok(Some(message)) = transport.receive() {
                recovered = Some(message);
                break;
            }
        }
        assert_eq!(recovered, Some(request));
    }

    #[test]
    fn test_blocking_peer_close_is_disconnect() {
        let (client, server) = pair();
        let transport = blocking(server);
        drop(client);

        let mut error = None;
        for _ in 0..200 {
            if let Err(e) = transport.receive() {
                error = Some(e);
                break;
            }
        }
        assert!(error.unwrap().is_disconnect());
    }

    #[test]
    fn test_blocking_write_timeout_is_slow_consumer() {
        let (client, server) = pair();
        let transport =
            BlockingTransport::new(server, Duration::from_millis(5), Duration::from_millis(50))
                .unwrap();

        // The client never reads, so the socket buffers eventually fill
        let payload = Bytes::from(vec![b'x'; 256 * 1024]);
        let mut error = None;
        for _ in 0..4096 {
            if let Err(e) = transport.send(&Message::new(1, 1, payload.clone())) {
                error = Some(e);
                break;
            }
        }
        let error = error.unwrap();
        assert!(matches!(error, ServerError::SlowConsumer));
        assert!(error.is_disconnect());
        drop(client);
    }

    #[tokio::test]
    async fn test_channel_transport() {
        let (transport, mut queue) = ChannelTransport::new(4);
        transport.send(&Message::heartbeat()).unwrap();
        transport.shutdown();

        assert!(matches!(queue.next().await, Some(m) if m.is_heartbeat()));
        assert!(queue.next().await.is_none());
        assert!(!queue.is_aborted());

        drop(queue);
        assert!(transport.send(&Message::heartbeat()).unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn test_channel_full_queue() {
        let (transport, mut queue) = ChannelTransport::new(2);
        transport.send(&Message::heartbeat()).unwrap();
        transport.send(&Message::heartbeat()).unwrap();

        let err = transport.send(&Message::heartbeat()).unwrap_err();
        assert!(matches!(err, ServerError::SlowConsumer));
        assert!(err.is_disconnect());

        // No room for the close marker, so the writer is aborted
        transport.shutdown();
        assert!(queue.is_aborted());
        assert!(queue.next().await.is_none());
    }

    #[test]
    fn test_full_queue_closes_session() {
        let (transport, _queue) = ChannelTransport::new(1);
        let session = Session::new(
            TransportKind::EventLoop,
            "127.0.0.1:7000".parse().unwrap(),
            Box::new(transport),
        );

        session.send_message(&Message::heartbeat()).unwrap();
        assert!(!session.is_closed());
        session.send_message(&Message::heartbeat()).unwrap();
        assert!(session.is_closed());
    }
}
