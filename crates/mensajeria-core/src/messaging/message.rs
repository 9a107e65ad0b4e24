//! Message records.

use super::session::{ChatId, UserId};
use crate::crypto::EncryptionEnvelope;
use crate::error::{Error, Result};
use crate::protocol::ChatMessagePayload;
use chrono::{DateTime, Utc};
use std::fmt;
use zeroize::Zeroizing;

/// Unique identifier for a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Get as bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A stored message. The body is only ever held encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Unique message identifier.
    pub message_id: MessageId,
    /// Owning chat.
    pub chat_id: ChatId,
    /// Author.
    pub sender_id: UserId,
    /// Encrypted body.
    pub envelope: EncryptionEnvelope,
    /// Creation time (millisecond precision).
    pub created_at: DateTime<Utc>,
    /// Expiry time; `None` never expires.
    pub delete_at: Option<DateTime<Utc>>,
    /// Whether a recipient has read it.
    pub read_flag: bool,
    /// Position within the chat, assigned under the chat's lock.
    pub seq: u64,
}

impl MessageRecord {
    /// Whether the message has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.delete_at.is_some_and(|d| d <= now)
    }

    /// Wire form for a chat-message envelope.
    pub fn to_payload(&self) -> ChatMessagePayload {
        ChatMessagePayload {
            message_id: self.message_id.0,
            chat_id: self.chat_id.0,
            sender_id: self.sender_id.0,
            envelope: self.envelope.to_bytes(),
            created_at: self.created_at.timestamp_millis(),
            delete_at: self.delete_at.map(|d| d.timestamp_millis()),
        }
    }

    /// Build from a validated wire payload. `seq` is assigned by the receiver,
    /// which also re-stamps the sender's timestamps.
    pub fn from_payload(payload: &ChatMessagePayload, seq: u64) -> Result<Self> {
        let created_at = from_millis(payload.created_at)?;
        let delete_at = payload.delete_at.map(from_millis).transpose()?;

        Ok(Self {
            message_id: MessageId(payload.message_id),
            chat_id: ChatId(payload.chat_id),
            sender_id: UserId(payload.sender_id),
            envelope: payload
                .encryption_envelope()
                .map_err(|_| Error::MalformedEnvelope)?,
            created_at,
            delete_at,
            read_flag: false,
            seq,
        })
    }
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(Error::MalformedEnvelope)
}

/// A message paired with its decryption outcome.
///
/// Decryption failures are per message so one bad envelope never hides the
/// rest of a page.
#[derive(Debug)]
pub struct DecryptedMessage {
    /// The stored record.
    pub record: MessageRecord,
    /// Plaintext, or the reason it could not be recovered.
    pub plaintext: Result<Zeroizing<Vec<u8>>>,
}

impl DecryptedMessage {
    /// Plaintext as UTF-8 text, if decryption succeeded and it is valid.
    pub fn text(&self) -> Option<&str> {
        self.plaintext
            .as_ref()
            .ok()
            .and_then(|p| std::str::from_utf8(p).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt, AlgorithmId};

    fn record(delete_at: Option<DateTime<Utc>>) -> MessageRecord {
        MessageRecord {
            message_id: MessageId([3u8; 16]),
            chat_id: ChatId(1),
            sender_id: UserId(2),
            envelope: encrypt(b"hola", "pw", AlgorithmId::Aes256Gcm, None).expect("encrypt"),
            created_at: from_millis(1_700_000_000_123).expect("time"),
            delete_at,
            read_flag: false,
            seq: 0,
        }
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::from_bytes([0xab; 16]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert_eq!(format!("{:?}", id), "MessageId(abababab)");
        assert!(MessageId::from_slice(&[0u8; 15]).is_none());
    }

    #[test]
    fn test_expiry() {
        let now = from_millis(1_700_000_000_000).expect("time");
        assert!(!record(None).is_expired(now));
        assert!(record(Some(now)).is_expired(now));
        assert!(!record(Some(now + chrono::Duration::seconds(1))).is_expired(now));
    }

    #[test]
    fn test_payload_conversion() {
        let original = record(Some(from_millis(1_700_000_360_000).expect("time")));
        let payload = original.to_payload();
        let restored = MessageRecord::from_payload(&payload, 0).expect("convert");
        assert_eq!(restored, original);
    }

    #[test]
    fn test_decrypted_text() {
        let msg = DecryptedMessage {
            record: record(None),
            plaintext: Ok(Zeroizing::new(b"hola".to_vec())),
        };
        assert_eq!(msg.text(), Some("hola"));

        let failed = DecryptedMessage {
            record: record(None),
            plaintext: Err(Error::DecryptionFailed),
        };
        assert_eq!(failed.text(), None);
    }
}
