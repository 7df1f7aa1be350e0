//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or text frame handling.
///
/// A protocol error is fatal to the current decode attempt only. Whether the
/// connection survives it is up to the caller.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame marker: expected {expected:#06x}, got {actual:#06x}")]
    BadMarker { expected: i16, actual: i16 },

    #[error("check code mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CheckCodeMismatch { expected: i16, actual: i16 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("negative payload length: {0}")]
    NegativeLength(i32),

    #[error("text frame check code mismatch: expected {expected}, got {actual}")]
    TextCheckMismatch { expected: String, actual: String },

    #[error("command code out of range: {0}")]
    CodeOutOfRange(i64),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error came from the underlying transport rather
    /// than from malformed bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }

    /// Returns whether the decoder can no longer find the next frame
    /// boundary, so buffered bytes must be dropped.
    pub fn breaks_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMarker { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::NegativeLength(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::BadMarker {
            expected: 0x2B2B,
            actual: 0x1234,
        };
        let msg = err.to_string();
        assert!(msg.contains("marker"));
        assert!(msg.contains("0x2b2b"));
        assert!(msg.contains("0x1234"));

        let err = ProtocolError::CheckCodeMismatch {
            expected: 0x0264,
            actual: 0x0266,
        };
        assert!(err.to_string().contains("0x0266"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::NegativeLength(-4);
        assert!(err.to_string().contains("-4"));

        let err = ProtocolError::MissingField("checkCode");
        assert!(err.to_string().contains("checkCode"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_is_io() {
        let err = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_io());
        assert!(!ProtocolError::InvalidUtf8.is_io());
    }

    #[test]
    fn test_breaks_framing() {
        assert!(ProtocolError::NegativeLength(-1).breaks_framing());
        assert!(ProtocolError::BadMarker {
            expected: 0x2B2B,
            actual: 0
        }
        .breaks_framing());
        // The mismatching frame was consumed; the next one is intact
        assert!(!ProtocolError::CheckCodeMismatch {
            expected: 0x0264,
            actual: 0x026C
        }
        .breaks_framing());
    }
}
