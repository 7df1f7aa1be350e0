//! Binary frame format.
//!
//! All multi-byte integers are big-endian. A frame with payload:
//!
//! ```text
//! +-----------+----------+------------+--------+-------+----------------+
//! | body_head |  length  | check_code | master | slave | data           |
//! |  2 bytes  | 4 bytes  |  2 bytes   | 1 byte | 1 byte| length bytes   |
//! +-----------+----------+------------+--------+-------+----------------+
//! ```
//!
//! A control frame (`length == 0`) carries no check code:
//!
//! ```text
//! +-----------+----------+--------+-------+
//! | body_head |  length  | master | slave |
//! |  2 bytes  | 4 bytes  | 1 byte | 1 byte|
//! +-----------+----------+--------+-------+
//! ```
//!
//! The check code is a lossy OR-reduction that only catches gross framing
//! corruption. It is not a checksum in any cryptographic sense and most
//! single-bit flips go unnoticed. Existing clients compute it exactly this
//! way, so it must stay bit-for-bit identical; anything stronger needs a new
//! protocol version.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed marker opening every frame.
pub const BODY_HEAD: i16 = 0x2B2B;

/// Smallest decodable unit: marker + length + the two command bytes.
pub const MIN_FRAME_SIZE: usize = 8;

/// Marker + length.
const PREFIX_SIZE: usize = 6;

/// Seed of the check code reduction.
const CHECK_SEED: i32 = 996;

/// Bits of each covered byte folded into the accumulator.
const CHECK_BYTE_MASK: i32 = 0x8A;

/// Bits of the accumulator kept in the final code.
const CHECK_RESULT_MASK: i32 = 0x1E6C;

/// Computes the check code over `master, slave, data`.
pub fn check_code(master: i8, slave: i8, data: &[u8]) -> i16 {
    let mut acc = CHECK_SEED;
    for b in [master as u8, slave as u8].iter().chain(data) {
        acc |= i32::from(*b) & CHECK_BYTE_MASK;
    }
    (acc & CHECK_RESULT_MASK) as i16
}

/// Returns the total encoded size of a frame carrying `length` payload bytes.
pub fn frame_len(length: usize) -> usize {
    if length == 0 {
        MIN_FRAME_SIZE
    } else {
        MIN_FRAME_SIZE + 2 + length
    }
}

/// Encodes a message into a frame.
pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::with_capacity(frame_len(message.data.len()));
    encode_into(message, &mut buf)?;
    Ok(buf)
}

/// Encodes a message, appending the frame to `buf`.
pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let length = message.data.len();
    if length > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: length as u32,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    buf.reserve(frame_len(length));
    buf.put_i16(BODY_HEAD);
    buf.put_i32(length as i32);

    if length > 0 {
        buf.put_i16(check_code(
            message.master_code,
            message.slave_code,
            &message.data,
        ));
    }

    buf.put_i8(message.master_code);
    buf.put_i8(message.slave_code);
    buf.put_slice(&message.data);

    Ok(())
}

/// Decodes a message from the front of `buf`.
///
/// Returns `Ok(Some(message))` if a complete frame was decoded, `Ok(None)` if
/// more data is needed, or `Err` on protocol errors. Nothing is consumed on a
/// bad marker or an invalid length. A frame whose check code does not match is
/// consumed before the error is returned.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < MIN_FRAME_SIZE {
        return Ok(None);
    }

    // Peek at the prefix without consuming
    let marker = i16::from_be_bytes([buf[0], buf[1]]);
    if marker != BODY_HEAD {
        return Err(ProtocolError::BadMarker {
            expected: BODY_HEAD,
            actual: marker,
        });
    }

    let length = i32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    if length < 0 {
        return Err(ProtocolError::NegativeLength(length));
    }
    if length as u32 > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length as u32,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let length = length as usize;
    if buf.len() < frame_len(length) {
        return Ok(None);
    }

    buf.advance(PREFIX_SIZE);

    if length == 0 {
        let master = buf.get_i8();
        let slave = buf.get_i8();
        return Ok(Some(Message::empty(master, slave)));
    }

    let expected = buf.get_i16();
    let master = buf.get_i8();
    let slave = buf.get_i8();
    let data = buf.split_to(length).freeze();

    let actual = check_code(master, slave, &data);
    if actual != expected {
        return Err(ProtocolError::CheckCodeMismatch { expected, actual });
    }

    Ok(Some(Message::new(master, slave, data)))
}
