//! Signed wire protocol.
//!
//! A strict binary, versioned envelope authenticated with HMAC-SHA256 under
//! a shared secret. The payload is opaque to the framing: usually an
//! encryption envelope inside a chat message, otherwise plaintext control
//! data.
//!
//! ## Protocol Rules
//!
//! - Canonical encoding: fixed field order, fixed-width big-endian integers
//! - Constant-time signature check
//! - Verification failures, malformed framing and invalid payload schemas
//!   are indistinguishable to the caller
//! - Versioned for forward compatibility
//!
//! ## Envelope Structure
//!
//! ```text
//! ┌─────────┬─────────┬───────────┬──────────┬───────────┬───────────┐
//! │  Type   │ Version │ Timestamp │  Length  │  Payload  │ Signature │
//! │ (1 byte)│ (1 byte)│ (8 bytes) │ (4 bytes)│ (variable)│ (32 bytes)│
//! └─────────┴─────────┴───────────┴──────────┴───────────┴───────────┘
//! ```
//!
//! The signature covers everything before it. Maximum payload size: 64 KiB

mod envelope;
mod payloads;
mod types;

pub use envelope::{ProtocolEnvelope, VerifiedEnvelope, HEADER_SIZE, SIGNATURE_SIZE};
pub use payloads::{
    AuthRequest, AuthResponse, ChatList, ChatMessagePayload, ChatSummary, ErrorPayload,
    MessageList, PageInfo, ProtocolPayload, StatusEvent, StatusKind,
};
pub use types::{MessageType, Payload};

use crate::error::{Error, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Validate that a protocol version is supported.
pub fn validate_version(version: u8) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::MalformedEnvelope);
    }
    Ok(())
}
