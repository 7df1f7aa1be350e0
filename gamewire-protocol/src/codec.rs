//! Buffered decoding and the framed-transport codec.

use crate::error::ProtocolError;
use crate::frame;
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Accumulates inbound bytes and decodes whole messages out of them.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Mutable access to the buffer, for reading sockets into it directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        frame::decode(&mut self.buffer)
    }

    /// Returns whether enough bytes are buffered to attempt a decode at all.
    pub fn has_minimum(&self) -> bool {
        self.buffer.len() >= frame::MIN_FRAME_SIZE
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops everything buffered, e.g. after a bad marker.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// `tokio_util` codec for event-loop transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl tokio_util::codec::Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        frame::decode(src)
    }
}

impl tokio_util::codec::Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame::encode_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    #[test]
    fn test_decoder_roundtrip() {
        let msg = Message::new(1, 3, Bytes::from(r#"{"name":"x"}"#));
        let encoded = frame::encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        assert_eq!(decoder.decode().unwrap().unwrap(), msg);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let msg = Message::new(1, 1, Bytes::from("partial"));
        let encoded = frame::encode(&msg).unwrap();

        let mut decoder = Decoder::new();

        // Feed partial data
        decoder.extend(&encoded[..4]);
        assert!(!decoder.has_minimum());
        assert!(decoder.decode().unwrap().is_none());

        decoder.extend(&encoded[4..9]);
        assert!(decoder.has_minimum());
        assert!(decoder.decode().unwrap().is_none());

        // Feed the rest
        decoder.extend(&encoded[9..]);
        assert_eq!(decoder.decode().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);

        decoder.extend_bytes(Bytes::from_static(b"more"));
        assert_eq!(decoder.buffered(), 13);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::new(5, 6, Bytes::from("abc")), &mut buf)
            .unwrap();
        codec.encode(Message::heartbeat(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.code(), crate::CommandCode::new(5, 6));
        assert_eq!(&first.data[..], b"abc");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_heartbeat());

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
