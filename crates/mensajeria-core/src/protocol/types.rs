//! Message types and the typed-payload contract.

use super::MAX_PAYLOAD_SIZE;
use crate::error::{Error, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Message types carried in a protocol envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Login request.
    AuthRequest = 0x01,
    /// Login result.
    AuthResponse = 0x02,
    /// Encrypted chat message.
    ChatMessage = 0x03,
    /// Typing, read and presence events.
    StatusEvent = 0x04,
    /// Page of chat summaries.
    ChatList = 0x05,
    /// Page of messages from one chat.
    MessageList = 0x06,
    /// Error report.
    Error = 0x07,
}

impl MessageType {
    /// Parse message type from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::AuthRequest),
            0x02 => Ok(Self::AuthResponse),
            0x03 => Ok(Self::ChatMessage),
            0x04 => Ok(Self::StatusEvent),
            0x05 => Ok(Self::ChatList),
            0x06 => Ok(Self::MessageList),
            0x07 => Ok(Self::Error),
            _ => Err(Error::MalformedEnvelope),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// bincode settings shared by every payload: fixed-width integers, a hard
/// size limit and no trailing bytes.
fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

/// A schema-checked payload bound to one [`MessageType`].
pub trait Payload: Serialize + DeserializeOwned {
    /// The envelope type that carries this payload.
    const TYPE: MessageType;

    /// Check required fields and value ranges.
    fn validate(&self) -> Result<()>;

    /// Validate, then serialize.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        options()
            .serialize(self)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Deserialize, then validate. Any failure is `MalformedEnvelope`.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let payload: Self = options()
            .deserialize(bytes)
            .map_err(|_| Error::MalformedEnvelope)?;
        payload.validate().map_err(|_| Error::MalformedEnvelope)?;
        Ok(payload)
    }
}

/// Fail validation unless `cond` holds.
pub(crate) fn ensure(cond: bool, what: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::Encoding(format!("invalid payload: {}", what)))
    }
}
