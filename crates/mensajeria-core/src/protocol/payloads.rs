//! Payload schemas for every message type.
//!
//! Each payload validates itself after decoding; an envelope whose payload
//! fails validation is treated exactly like one with a bad signature.

use super::types::{ensure, MessageType, Payload};
use crate::crypto::{AlgorithmId, EncryptionEnvelope};
use crate::error::Result;
use crate::logging::Redacted;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a device identifier.
const MAX_DEVICE_ID_LEN: usize = 100;

/// Minimum password length accepted in an auth request.
const MIN_PASSWORD_LEN: usize = 6;

/// Length bounds for usernames.
const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=50;

fn valid_username(username: &str) -> bool {
    USERNAME_LEN.contains(&username.chars().count())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Login request.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// 3 to 50 characters of `[A-Za-z0-9_-]`.
    pub username: String,
    /// At least 6 characters.
    pub password: String,
    /// Optional client device identifier.
    pub device_id: Option<String>,
}

impl Payload for AuthRequest {
    const TYPE: MessageType = MessageType::AuthRequest;

    fn validate(&self) -> Result<()> {
        ensure(valid_username(&self.username), "username")?;
        ensure(self.password.chars().count() >= MIN_PASSWORD_LEN, "password length")?;
        ensure(
            self.device_id
                .as_ref()
                .map_or(true, |d| d.chars().count() <= MAX_DEVICE_ID_LEN),
            "device id length",
        )
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &Redacted(&self.password))
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Login result.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Whether authentication succeeded.
    pub success: bool,
    /// Session token, required on success.
    pub access_token: Option<String>,
    /// Authenticated user, required on success.
    pub user_id: Option<i64>,
    /// Display name of the authenticated user.
    pub username: Option<String>,
    /// Failure reason, required on failure.
    pub error: Option<String>,
}

impl Payload for AuthResponse {
    const TYPE: MessageType = MessageType::AuthResponse;

    fn validate(&self) -> Result<()> {
        if self.success {
            ensure(
                self.access_token.as_deref().is_some_and(|t| !t.is_empty()),
                "access token",
            )?;
            ensure(self.user_id.is_some_and(|id| id > 0), "user id")
        } else {
            ensure(self.error.as_deref().is_some_and(|e| !e.is_empty()), "error")
        }
    }
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("success", &self.success)
            .field("access_token", &self.access_token.as_ref().map(Redacted))
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("error", &self.error)
            .finish()
    }
}

/// An encrypted chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    /// Random message id, used for deduplication.
    pub message_id: [u8; 16],
    /// Target chat.
    pub chat_id: i64,
    /// Author.
    pub sender_id: i64,
    /// Canonical bytes of an [`EncryptionEnvelope`].
    pub envelope: Vec<u8>,
    /// Creation time, Unix milliseconds.
    pub created_at: i64,
    /// Expiry time, Unix milliseconds.
    pub delete_at: Option<i64>,
}

impl ChatMessagePayload {
    /// Decode the embedded encryption envelope.
    pub fn encryption_envelope(&self) -> Result<EncryptionEnvelope> {
        EncryptionEnvelope::from_bytes(&self.envelope)
    }
}

impl Payload for ChatMessagePayload {
    const TYPE: MessageType = MessageType::ChatMessage;

    fn validate(&self) -> Result<()> {
        ensure(self.chat_id > 0, "chat id")?;
        ensure(self.sender_id > 0, "sender id")?;
        ensure(!self.envelope.is_empty(), "empty envelope")?;
        ensure(self.encryption_envelope().is_ok(), "encryption envelope")?;
        ensure(
            self.delete_at.map_or(true, |d| d >= self.created_at),
            "delete_at before created_at",
        )
    }
}

/// Kind of status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    /// A participant is typing.
    Typing,
    /// A participant read the chat.
    Read,
    /// A user came online.
    UserOnline,
    /// A user went offline.
    UserOffline,
}

/// Typing, read and presence notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Event kind.
    pub kind: StatusKind,
    /// User the event is about.
    pub user_id: i64,
    /// Chat scope; required for `Typing` and `Read`.
    pub chat_id: Option<i64>,
}

impl Payload for StatusEvent {
    const TYPE: MessageType = MessageType::StatusEvent;

    fn validate(&self) -> Result<()> {
        ensure(self.user_id > 0, "user id")?;
        ensure(self.chat_id.map_or(true, |id| id > 0), "chat id")?;
        match self.kind {
            StatusKind::Typing | StatusKind::Read => {
                ensure(self.chat_id.is_some(), "chat-scoped event without chat id")
            }
            StatusKind::UserOnline | StatusKind::UserOffline => Ok(()),
        }
    }
}

/// Pagination metadata shared by list payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Total items across all pages.
    pub total: u64,
    /// One-based page number.
    pub page: u32,
    /// Whether a later page exists.
    pub has_more: bool,
}

impl PageInfo {
    fn validate(&self, items: usize) -> Result<()> {
        ensure(self.page >= 1, "page")?;
        ensure(items as u64 <= self.total, "more items than total")
    }
}

/// One chat in a [`ChatList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Chat id.
    pub chat_id: i64,
    /// Participants.
    pub participant_ids: Vec<i64>,
    /// Chat algorithm.
    pub encryption_type: AlgorithmId,
    /// Auto-delete window, 0 = never.
    pub auto_delete_hours: u32,
    /// Unread messages for the requesting user.
    pub unread_count: u32,
    /// Newest message time, Unix milliseconds.
    pub last_message_at: Option<i64>,
}

/// Page of chat summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatList {
    /// Chats on this page.
    pub chats: Vec<ChatSummary>,
    /// Pagination.
    pub page: PageInfo,
}

impl Payload for ChatList {
    const TYPE: MessageType = MessageType::ChatList;

    fn validate(&self) -> Result<()> {
        self.page.validate(self.chats.len())?;
        for chat in &self.chats {
            ensure(chat.chat_id > 0, "chat id")?;
            ensure(!chat.participant_ids.is_empty(), "participants")?;
            ensure(chat.participant_ids.iter().all(|&id| id > 0), "participant id")?;
        }
        Ok(())
    }
}

/// Page of messages from one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageList {
    /// Chat the messages belong to.
    pub chat_id: i64,
    /// Messages on this page, oldest first.
    pub messages: Vec<ChatMessagePayload>,
    /// Pagination.
    pub page: PageInfo,
}

impl Payload for MessageList {
    const TYPE: MessageType = MessageType::MessageList;

    fn validate(&self) -> Result<()> {
        ensure(self.chat_id > 0, "chat id")?;
        self.page.validate(self.messages.len())?;
        for message in &self.messages {
            message.validate()?;
            ensure(message.chat_id == self.chat_id, "message from another chat")?;
        }
        Ok(())
    }
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl Payload for ErrorPayload {
    const TYPE: MessageType = MessageType::Error;

    fn validate(&self) -> Result<()> {
        ensure(!self.code.is_empty(), "error code")?;
        ensure(!self.message.is_empty(), "error message")
    }
}

/// A decoded, validated payload of any type.
#[derive(Debug, Clone)]
pub enum ProtocolPayload {
    /// See [`AuthRequest`].
    AuthRequest(AuthRequest),
    /// See [`AuthResponse`].
    AuthResponse(AuthResponse),
    /// See [`ChatMessagePayload`].
    ChatMessage(ChatMessagePayload),
    /// See [`StatusEvent`].
    StatusEvent(StatusEvent),
    /// See [`ChatList`].
    ChatList(ChatList),
    /// See [`MessageList`].
    MessageList(MessageList),
    /// See [`ErrorPayload`].
    Error(ErrorPayload),
}

impl ProtocolPayload {
    /// Decode and validate `bytes` according to `message_type`.
    pub fn decode(message_type: MessageType, bytes: &[u8]) -> Result<Self> {
        Ok(match message_type {
            MessageType::AuthRequest => Self::AuthRequest(AuthRequest::from_bytes(bytes)?),
            MessageType::AuthResponse => Self::AuthResponse(AuthResponse::from_bytes(bytes)?),
            MessageType::ChatMessage => Self::ChatMessage(ChatMessagePayload::from_bytes(bytes)?),
            MessageType::StatusEvent => Self::StatusEvent(StatusEvent::from_bytes(bytes)?),
            MessageType::ChatList => Self::ChatList(ChatList::from_bytes(bytes)?),
            MessageType::MessageList => Self::MessageList(MessageList::from_bytes(bytes)?),
            MessageType::Error => Self::Error(ErrorPayload::from_bytes(bytes)?),
        })
    }

    /// The type this payload travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::AuthRequest(_) => MessageType::AuthRequest,
            Self::AuthResponse(_) => MessageType::AuthResponse,
            Self::ChatMessage(_) => MessageType::ChatMessage,
            Self::StatusEvent(_) => MessageType::StatusEvent,
            Self::ChatList(_) => MessageType::ChatList,
            Self::MessageList(_) => MessageType::MessageList,
            Self::Error(_) => MessageType::Error,
        }
    }
}
