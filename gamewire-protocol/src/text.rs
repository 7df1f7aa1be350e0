//! JSON text frames for websocket clients.
//!
//! Inbound frames look like
//! `{"masterCode":1,"slaveCode":1,"data":"...","checkCode":"<md5 of data>"}`.
//! The MD5 field is a different and stronger integrity check than the
//! binary transport's check code. Outbound frames carry only the codes and
//! the payload text.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// A websocket text frame envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFrame {
    #[serde(default)]
    pub master_code: Option<i64>,

    #[serde(default)]
    pub slave_code: Option<i64>,

    #[serde(default)]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_code: Option<String>,
}

/// Lowercase hex MD5 digest of `text`.
pub fn md5_hex(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

impl TextFrame {
    /// Parses a text frame without validating it.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds a signed inbound-style frame (used by clients and tests).
    pub fn signed(master_code: i8, slave_code: i8, data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            master_code: Some(master_code.into()),
            slave_code: Some(slave_code.into()),
            check_code: Some(md5_hex(&data)),
            data: Some(data),
        }
    }

    /// Wraps an outbound message. The payload must be UTF-8 text.
    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let data = std::str::from_utf8(&message.data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Self {
            master_code: Some(message.master_code.into()),
            slave_code: Some(message.slave_code.into()),
            data: Some(data.to_string()),
            check_code: None,
        })
    }

    /// Validates an inbound frame and converts it into a message.
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        let master = narrow(self.master_code.ok_or(ProtocolError::MissingField("masterCode"))?)?;
        let slave = narrow(self.slave_code.ok_or(ProtocolError::MissingField("slaveCode"))?)?;
        let data = self.data.ok_or(ProtocolError::MissingField("data"))?;
        let check = self
            .check_code
            .ok_or(ProtocolError::MissingField("checkCode"))?;

        let actual = md5_hex(&data);
        if !check.eq_ignore_ascii_case(&actual) {
            return Err(ProtocolError::TextCheckMismatch {
                expected: check,
                actual,
            });
        }

        Ok(Message::new(master, slave, Bytes::from(data)))
    }

    /// Serializes the frame to JSON text.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn narrow(code: i64) -> Result<i8, ProtocolError> {
    i8::try_from(code).map_err(|_| ProtocolError::CodeOutOfRange(code))
}
