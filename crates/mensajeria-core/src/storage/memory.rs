//! In-memory persistence gateway.
//!
//! Useful for tests and for hosts that persist elsewhere. Availability can
//! be toggled to simulate an unreachable database, and loads are counted so
//! tests can observe cache hits and single-flight behaviour.

use super::SessionStore;
use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::messaging::{
    normalize_participants, sort_listings, ChatId, ChatListing, ChatSession, MessageId,
    MessageRange, MessageRecord, SessionUpdate, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    next_chat_id: i64,
    sessions: HashMap<ChatId, ChatSession>,
    by_participants: HashMap<Vec<UserId>, ChatId>,
    /// Messages per chat keyed by seq.
    messages: HashMap<ChatId, BTreeMap<u64, MessageRecord>>,
    locations: HashMap<MessageId, (ChatId, u64)>,
    hidden: HashSet<(ChatId, UserId)>,
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    appends_failing: AtomicBool,
    session_loads: AtomicUsize,
    message_loads: AtomicUsize,
    appends: AtomicUsize,
    load_delay: Mutex<Option<Duration>>,
    append_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail only `append_message`, leaving reads working. Lets tests reach
    /// an eviction whose flush fails.
    pub fn set_appends_failing(&self, failing: bool) {
        self.appends_failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every `load_session` call, to widen race windows in tests.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    /// Delay every `append_message` call, so tests can cancel a flush
    /// mid-append.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.lock() = delay;
    }

    /// Number of `load_session` calls served.
    pub fn session_loads(&self) -> usize {
        self.session_loads.load(Ordering::SeqCst)
    }

    /// Number of `load_messages` calls served.
    pub fn message_loads(&self) -> usize {
        self.message_loads.load(Ordering::SeqCst)
    }

    /// Number of committed appends.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Number of durable messages in a chat.
    pub fn message_count(&self, chat_id: ChatId) -> usize {
        self.inner
            .lock()
            .messages
            .get(&chat_id)
            .map_or(0, BTreeMap::len)
    }

    /// Whether a message is durably stored.
    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.inner.lock().locations.contains_key(id)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("memory store offline".into()));
        }
        Ok(())
    }
}

fn not_found(chat_id: ChatId) -> Error {
    Error::NotFound(format!("chat {}", chat_id))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        participants: &[UserId],
        config: &ChatConfig,
    ) -> Result<ChatSession> {
        self.check()?;
        let participant_ids = normalize_participants(participants);
        let mut inner = self.inner.lock();

        if let Some(id) = inner.by_participants.get(&participant_ids) {
            if let Some(existing) = inner.sessions.get(id) {
                return Ok(existing.clone());
            }
        }

        inner.next_chat_id += 1;
        let session = ChatSession {
            chat_id: ChatId(inner.next_chat_id),
            participant_ids: participant_ids.clone(),
            encryption_type: config.encryption_type,
            key_material: None,
            auto_delete_hours: config.auto_delete_hours,
        };
        inner.by_participants.insert(participant_ids, session.chat_id);
        inner.sessions.insert(session.chat_id, session.clone());
        Ok(session)
    }

    async fn load_session(&self, chat_id: ChatId) -> Result<ChatSession> {
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.session_loads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .sessions
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| not_found(chat_id))
    }

    async fn load_messages(
        &self,
        chat_id: ChatId,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>> {
        self.check()?;
        self.message_loads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        if !inner.sessions.contains_key(&chat_id) {
            return Err(not_found(chat_id));
        }
        let Some(messages) = inner.messages.get(&chat_id) else {
            return Ok(Vec::new());
        };

        let mut page: Vec<MessageRecord> = messages
            .values()
            .rev()
            .skip(range.offset)
            .take(range.limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn append_message(&self, chat_id: ChatId, record: &MessageRecord) -> Result<()> {
        let delay = *self.append_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        if self.appends_failing.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("append rejected".into()));
        }
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&chat_id) {
            return Err(not_found(chat_id));
        }
        if inner.locations.contains_key(&record.message_id) {
            return Ok(());
        }
        inner
            .messages
            .entry(chat_id)
            .or_default()
            .insert(record.seq, record.clone());
        inner.locations.insert(record.message_id, (chat_id, record.seq));
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn message_exists(&self, id: &MessageId) -> Result<bool> {
        self.check()?;
        Ok(self.contains_message(id))
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<usize> {
        self.check()?;
        let mut inner = self.inner.lock();
        let mut deleted = 0;
        for id in ids {
            if let Some((chat_id, seq)) = inner.locations.remove(id) {
                if let Some(messages) = inner.messages.get_mut(&chat_id) {
                    messages.remove(&seq);
                }
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn update_session_config(&self, chat_id: ChatId, update: &SessionUpdate) -> Result<()> {
        self.check()?;
        self.inner
            .lock()
            .sessions
            .get_mut(&chat_id)
            .ok_or_else(|| not_found(chat_id))?
            .apply(update);
        Ok(())
    }

    async fn expired_messages(&self, now: DateTime<Utc>) -> Result<Vec<(ChatId, MessageId)>> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .flat_map(|(chat_id, messages)| {
                messages
                    .values()
                    .filter(move |m| m.is_expired(now))
                    .map(move |m| (*chat_id, m.message_id))
            })
            .collect())
    }

    async fn mark_read(&self, chat_id: ChatId, reader: UserId) -> Result<usize> {
        self.check()?;
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&chat_id) {
            return Err(not_found(chat_id));
        }
        let mut changed = 0;
        if let Some(messages) = inner.messages.get_mut(&chat_id) {
            for m in messages.values_mut() {
                if m.sender_id != reader && !m.read_flag {
                    m.read_flag = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn list_chats(&self, user: UserId, include_hidden: bool) -> Result<Vec<ChatListing>> {
        self.check()?;
        let inner = self.inner.lock();
        let mut listings: Vec<ChatListing> = inner
            .sessions
            .values()
            .filter(|s| s.has_participant(user))
            .map(|session| {
                let messages = inner.messages.get(&session.chat_id);
                let mut listing = ChatListing {
                    session: session.clone(),
                    hidden: inner.hidden.contains(&(session.chat_id, user)),
                    unread_count: 0,
                    last_message_at: None,
                };
                for m in messages.into_iter().flat_map(BTreeMap::values) {
                    if m.sender_id != user && !m.read_flag {
                        listing.unread_count += 1;
                    }
                    listing.last_message_at = listing.last_message_at.max(Some(m.created_at));
                }
                listing
            })
            .filter(|l| include_hidden || !l.hidden)
            .collect();
        sort_listings(&mut listings);
        Ok(listings)
    }

    async fn set_hidden(&self, chat_id: ChatId, user: UserId, hide: bool) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let session = inner.sessions.get(&chat_id).ok_or_else(|| not_found(chat_id))?;
        if !session.has_participant(user) {
            return Err(Error::NotFound(format!("user {} in chat {}", user, chat_id)));
        }
        if hide {
            inner.hidden.insert((chat_id, user));
        } else {
            inner.hidden.remove(&(chat_id, user));
        }
        Ok(())
    }
}
