//! Signed envelope framing, signing and verification.
//!
//! An envelope is untrusted until its HMAC verifies. Type and payload are
//! only reachable through [`VerifiedEnvelope`], which exists only after
//! verification and schema validation both succeeded.

use super::payloads::ProtocolPayload;
use super::types::{MessageType, Payload};
use super::{validate_version, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::codec::{Reader, Writer};
use crate::config::SigningSecret;
use crate::error::{Error, Result};
use crate::logging::ShortHex;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 output size.
pub const SIGNATURE_SIZE: usize = 32;

/// Signed header: type (1) + version (1) + timestamp (8) + length (4).
pub const HEADER_SIZE: usize = 14;

/// A protocol envelope as received or about to be sent.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtocolEnvelope {
    message_type: MessageType,
    version: u8,
    timestamp: i64,
    payload: Vec<u8>,
    signature: [u8; SIGNATURE_SIZE],
}

/// Canonical bytes covered by the signature.
fn signed_bytes(message_type: MessageType, version: u8, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(HEADER_SIZE + payload.len());
    w.u8(message_type.to_byte())
        .u8(version)
        .i64(timestamp)
        .long_bytes(payload);
    w.finish()
}

fn mac(secret: &SigningSecret) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

impl ProtocolEnvelope {
    /// Sign `payload` as `message_type`, stamped with the current time.
    pub fn sign(
        message_type: MessageType,
        payload: Vec<u8>,
        secret: &SigningSecret,
    ) -> Result<Self> {
        let now = chrono::Utc::now().timestamp_millis();
        Self::sign_at(message_type, payload, now, secret)
    }

    /// Sign with an explicit Unix-millisecond timestamp.
    pub fn sign_at(
        message_type: MessageType,
        payload: Vec<u8>,
        timestamp: i64,
        secret: &SigningSecret,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        let mut mac = mac(secret).ok_or_else(|| Error::Crypto("HMAC key rejected".into()))?;
        mac.update(&signed_bytes(message_type, PROTOCOL_VERSION, timestamp, &payload));
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&mac.finalize().into_bytes());

        Ok(Self {
            message_type,
            version: PROTOCOL_VERSION,
            timestamp,
            payload,
            signature,
        })
    }

    /// Validate, encode and sign a typed payload.
    pub fn sign_payload<P: Payload>(payload: &P, secret: &SigningSecret) -> Result<Self> {
        Self::sign(P::TYPE, payload.to_bytes()?, secret)
    }

    /// Check the signature in constant time.
    ///
    /// Never fails loudly: any problem is simply `false`.
    pub fn verify(&self, secret: &SigningSecret) -> bool {
        let Some(mut mac) = mac(secret) else {
            return false;
        };
        mac.update(&signed_bytes(
            self.message_type,
            self.version,
            self.timestamp,
            &self.payload,
        ));
        mac.verify_slice(&self.signature).is_ok()
    }

    /// Decode and verify raw bytes. Malformed input is `false`, not an error.
    pub fn verify_bytes(bytes: &[u8], secret: &SigningSecret) -> bool {
        Self::from_bytes(bytes).is_ok_and(|env| env.verify(secret))
    }

    /// Verify, then decode and validate the payload.
    pub fn into_verified(self, secret: &SigningSecret) -> Result<VerifiedEnvelope> {
        if !self.verify(secret) {
            return Err(Error::MalformedEnvelope);
        }
        let payload = ProtocolPayload::decode(self.message_type, &self.payload)
            .map_err(|_| Error::MalformedEnvelope)?;

        Ok(VerifiedEnvelope {
            timestamp: self.timestamp,
            version: self.version,
            payload,
        })
    }

    /// Decode, verify and validate in one step.
    ///
    /// Every failure is reported as the same `MalformedEnvelope`.
    pub fn open(bytes: &[u8], secret: &SigningSecret) -> Result<VerifiedEnvelope> {
        let result = Self::from_bytes(bytes).and_then(|env| env.into_verified(secret));
        if result.is_err() {
            debug!(len = bytes.len(), "rejected protocol envelope");
        }
        result
    }

    /// Wire encoding: signed header and payload followed by the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            signed_bytes(self.message_type, self.version, self.timestamp, &self.payload);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    /// Parse the wire encoding.
    ///
    /// Truncated, oversized or trailing input, unknown types and unknown
    /// versions are all `MalformedEnvelope`. The signature is not checked.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + SIGNATURE_SIZE {
            return Err(Error::MalformedEnvelope);
        }
        let mut r = Reader::new(bytes);
        let message_type = MessageType::from_byte(r.u8().ok_or(Error::MalformedEnvelope)?)?;
        let version = r.u8().ok_or(Error::MalformedEnvelope)?;
        validate_version(version)?;
        let timestamp = r.i64().ok_or(Error::MalformedEnvelope)?;
        let payload = r
            .long_bytes(MAX_PAYLOAD_SIZE)
            .ok_or(Error::MalformedEnvelope)?
            .to_vec();
        let signature: [u8; SIGNATURE_SIZE] = r
            .take(SIGNATURE_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(Error::MalformedEnvelope)?;
        if !r.is_empty() {
            return Err(Error::MalformedEnvelope);
        }

        Ok(Self {
            message_type,
            version,
            timestamp,
            payload,
            signature,
        })
    }

    /// Unix-millisecond timestamp (unauthenticated until verified).
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl fmt::Debug for ProtocolEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEnvelope")
            .field("version", &self.version)
            .field("timestamp", &self.timestamp)
            .field("payload_len", &self.payload.len())
            .field("signature", &ShortHex(&self.signature))
            .finish_non_exhaustive()
    }
}

/// An envelope whose signature and payload schema both checked out.
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    timestamp: i64,
    version: u8,
    payload: ProtocolPayload,
}

impl VerifiedEnvelope {
    /// Message type.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Protocol version of the sender.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Signing time, Unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The validated payload.
    pub fn payload(&self) -> &ProtocolPayload {
        &self.payload
    }

    /// Take the validated payload.
    pub fn into_payload(self) -> ProtocolPayload {
        self.payload
    }
}
