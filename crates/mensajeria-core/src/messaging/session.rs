//! Chat sessions.
//!
//! A session is the persisted configuration of one chat: its participants,
//! its algorithm, its auto-delete window and, for RSA-OAEP chats, the sealed
//! key pair.

use crate::config::{ttl_from_hours, ChatConfig};
use crate::crypto::{AlgorithmId, SealedKeyPair};
use crate::protocol::ChatSummary;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::fmt;

/// Chat identifier assigned by the persistence gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted chat configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    /// Chat id.
    pub chat_id: ChatId,
    /// Participants, sorted and deduplicated.
    pub participant_ids: Vec<UserId>,
    /// Algorithm for every message in the chat.
    pub encryption_type: AlgorithmId,
    /// Sealed RSA key pair, present once an RSA-OAEP chat sent its first message.
    pub key_material: Option<SealedKeyPair>,
    /// Auto-delete window in hours; 0 disables expiry.
    pub auto_delete_hours: u32,
}

impl ChatSession {
    /// The chat's configurable settings.
    pub fn config(&self) -> ChatConfig {
        ChatConfig {
            encryption_type: self.encryption_type,
            auto_delete_hours: self.auto_delete_hours,
        }
    }

    /// Time-to-live for new messages, if expiry is enabled.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        ttl_from_hours(self.auto_delete_hours)
    }

    /// Whether `user` takes part in the chat.
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participant_ids.binary_search(&user).is_ok()
    }

    /// Apply an update in place.
    pub fn apply(&mut self, update: &SessionUpdate) {
        if let Some(alg) = update.encryption_type {
            self.encryption_type = alg;
        }
        if let Some(hours) = update.auto_delete_hours {
            self.auto_delete_hours = hours;
        }
        if let Some(keys) = &update.key_material {
            self.key_material = Some(keys.clone());
        }
    }
}

/// One chat as seen by one of its participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListing {
    /// Chat configuration.
    pub session: ChatSession,
    /// Whether the participant hid the chat.
    pub hidden: bool,
    /// Messages from other participants not yet read.
    pub unread_count: usize,
    /// Creation time of the newest message.
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ChatListing {
    /// Wire form for a [`ChatList`](crate::protocol::ChatList) item.
    pub fn to_summary(&self) -> ChatSummary {
        ChatSummary {
            chat_id: self.session.chat_id.0,
            participant_ids: self.session.participant_ids.iter().map(|u| u.0).collect(),
            encryption_type: self.session.encryption_type,
            auto_delete_hours: self.session.auto_delete_hours,
            unread_count: u32::try_from(self.unread_count).unwrap_or(u32::MAX),
            last_message_at: self.last_message_at.map(|t| t.timestamp_millis()),
        }
    }
}

/// Newest activity first, chats without messages last, then by id.
pub(crate) fn sort_listings(listings: &mut [ChatListing]) {
    listings.sort_by_key(|l| {
        (
            l.last_message_at.is_none(),
            Reverse(l.last_message_at),
            l.session.chat_id,
        )
    });
}

/// Normalize a participant list: sorted, no duplicates.
pub fn normalize_participants(participants: &[UserId]) -> Vec<UserId> {
    let mut ids = participants.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Fields changed by `update_session_config`. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// New algorithm.
    pub encryption_type: Option<AlgorithmId>,
    /// New auto-delete window.
    pub auto_delete_hours: Option<u32>,
    /// Newly generated key pair.
    pub key_material: Option<SealedKeyPair>,
}

/// A page of messages counted back from the newest one.
///
/// `offset` 0 with `limit` 20 is the 20 newest messages. Results are always
/// returned oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRange {
    /// Messages to skip, counting from the newest.
    pub offset: usize,
    /// Maximum messages to return.
    pub limit: usize,
}

impl MessageRange {
    /// The newest `limit` messages.
    pub fn latest(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for MessageRange {
    fn default() -> Self {
        Self::latest(50)
    }
}
