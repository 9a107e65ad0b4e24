//! Persistence gateways.
//!
//! The chat engine talks to durable storage only through [`SessionStore`].
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: in-process, with fault injection for tests
//! - [`SqliteStore`]: SQLite via rusqlite, blocking calls moved off the
//!   async runtime
//!
//! ## Contract
//!
//! - Every call is atomic at single-row granularity
//! - Calls for different chats may run concurrently
//! - Any failure is `StorageUnavailable`; a missing chat is `NotFound`

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteConfig, SqliteStore};

use crate::config::ChatConfig;
use crate::error::Result;
use crate::messaging::{
    ChatId, ChatListing, ChatSession, MessageId, MessageRange, MessageRecord, SessionUpdate,
    UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "mensajeria.db";

/// Durable storage for chats and messages.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Create a chat, or return the existing one with the same participant set.
    async fn create_session(
        &self,
        participants: &[UserId],
        config: &ChatConfig,
    ) -> Result<ChatSession>;

    /// Load a chat's configuration. A missing chat is `NotFound`.
    async fn load_session(&self, chat_id: ChatId) -> Result<ChatSession>;

    /// Load a page of messages, oldest first.
    async fn load_messages(
        &self,
        chat_id: ChatId,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>>;

    /// Durably append one message. Appending an id that already exists is
    /// a no-op, so a retried flush never duplicates.
    async fn append_message(&self, chat_id: ChatId, record: &MessageRecord) -> Result<()>;

    /// Whether a message id is durably stored.
    async fn message_exists(&self, id: &MessageId) -> Result<bool>;

    /// Delete messages by id, returning how many existed.
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<usize>;

    /// Change chat configuration fields.
    async fn update_session_config(&self, chat_id: ChatId, update: &SessionUpdate) -> Result<()>;

    /// All messages with `delete_at <= now`.
    async fn expired_messages(&self, now: DateTime<Utc>) -> Result<Vec<(ChatId, MessageId)>>;

    /// Mark messages not sent by `reader` as read, returning how many changed.
    async fn mark_read(&self, chat_id: ChatId, reader: UserId) -> Result<usize>;

    /// Chats `user` takes part in, newest durable message first. Hidden
    /// chats are skipped unless `include_hidden`.
    async fn list_chats(&self, user: UserId, include_hidden: bool) -> Result<Vec<ChatListing>>;

    /// Hide or unhide a chat for one participant. An unknown chat or a
    /// non-participant is `NotFound`.
    async fn set_hidden(&self, chat_id: ChatId, user: UserId, hide: bool) -> Result<()>;
}
