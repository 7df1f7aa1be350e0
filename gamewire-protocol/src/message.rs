//! The message unit and its command code pair.

use bytes::Bytes;
use std::fmt;

/// `(master, slave)` pair selecting the handler for a message.
///
/// Ordering is the natural signed-byte order, master first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandCode {
    pub master: i8,
    pub slave: i8,
}

impl CommandCode {
    /// The code carried by heartbeat and other control messages.
    pub const CONTROL: CommandCode = CommandCode::new(0, 0);

    pub const fn new(master: i8, slave: i8) -> Self {
        Self { master, slave }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.master, self.slave)
    }
}

impl From<(i8, i8)> for CommandCode {
    fn from((master, slave): (i8, i8)) -> Self {
        Self::new(master, slave)
    }
}

/// A single protocol message.
///
/// A message with an empty payload is a control message (heartbeat) and is
/// framed without a check code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub master_code: i8,
    pub slave_code: i8,
    pub data: Bytes,
}

impl Message {
    /// Creates a message with the given codes and payload.
    pub fn new(master_code: i8, slave_code: i8, data: impl Into<Bytes>) -> Self {
        Self {
            master_code,
            slave_code,
            data: data.into(),
        }
    }

    /// Creates a message without payload.
    pub fn empty(master_code: i8, slave_code: i8) -> Self {
        Self::new(master_code, slave_code, Bytes::new())
    }

    /// Creates the zero-payload `(0, 0)` heartbeat.
    pub fn heartbeat() -> Self {
        Self::empty(0, 0)
    }

    /// Creates a message addressed with a command code pair.
    pub fn with_code(code: CommandCode, data: impl Into<Bytes>) -> Self {
        Self::new(code.master, code.slave, data)
    }

    /// Returns the command code pair.
    pub fn code(&self) -> CommandCode {
        CommandCode::new(self.master_code, self.slave_code)
    }

    /// Returns whether this is a control message (no payload).
    pub fn is_control(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns whether this is the `(0, 0)` heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.is_control() && self.code() == CommandCode::CONTROL
    }
}
