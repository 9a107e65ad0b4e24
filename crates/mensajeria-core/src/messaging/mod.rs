//! Chat sessions, messages and the cache/sync engine.
//!
//! ## Layout
//!
//! - [`ChatSession`] and [`MessageRecord`]: what the store persists
//! - [`ChatEngine`]: bounded LRU cache of chats in front of a
//!   [`SessionStore`](crate::storage::SessionStore), with per-chat
//!   serialization and single-flight loads
//! - [`CleanupTask`]: periodic flush and expiry sweep
//!
//! Message bodies are only held encrypted. Plaintext exists transiently in
//! [`DecryptedMessage`] results handed to the caller.

mod clock;
mod engine;
mod lru;
mod message;
mod session;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Accepted, ChatEngine, ChatInfo};
pub use message::{DecryptedMessage, MessageId, MessageRecord};
pub use session::{
    normalize_participants, ChatId, ChatListing, ChatSession, MessageRange, SessionUpdate,
    UserId,
};
pub(crate) use session::sort_listings;
pub use sweeper::CleanupTask;

use crate::crypto::random_bytes;

/// Generate a random message ID.
pub fn generate_message_id() -> MessageId {
    MessageId(random_bytes())
}
