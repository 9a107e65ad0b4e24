//! Chat cache and sync engine.
//!
//! The engine keeps up to `cache_capacity` chats resident, each with its
//! newest `message_window` messages, and mediates every read and write
//! between callers and the [`SessionStore`].
//!
//! ## Locking
//!
//! - `slots` maps chat ids to a resident entry or an in-flight load. It is
//!   only held for map lookups, never across an await.
//! - `lru` orders resident chats by recency, under its own lock.
//! - Each resident chat has one async mutex. Every operation on a chat
//!   (send, read, flush, expiry, eviction) holds it, so two sends on one
//!   chat never interleave while different chats proceed in parallel.
//! - `admission` serializes capacity checks so the resident count never
//!   exceeds capacity. It is always taken before a chat mutex.
//!
//! ## Entry lifecycle
//!
//! ```text
//! absent ──load──▶ resident(clean) ──write-back append──▶ resident(dirty)
//!    ▲                   │  ▲                                  │
//!    │                   │  └──────────── flush ───────────────┘
//!    └──── evict ────────┘
//! ```
//!
//! A dirty entry is flushed before it is evicted. If the flush fails the
//! entry stays resident and the next least recently used chat is tried.

use super::clock::{truncate_millis, Clock, SystemClock};
use super::generate_message_id;
use super::lru::LruList;
use super::message::{DecryptedMessage, MessageId, MessageRecord};
use super::session::{
    sort_listings, ChatId, ChatListing, ChatSession, MessageRange, SessionUpdate, UserId,
};
use crate::config::{ChatConfig, EngineConfig, WritePolicy};
use crate::crypto::{decrypt, encrypt, AlgorithmId, ChatKeyPair, ChatPublicKey};
use crate::error::{Error, Result};
use crate::logging::sanitize_for_log;
use crate::protocol::{ChatMessagePayload, ProtocolEnvelope, ProtocolPayload, VerifiedEnvelope};
use crate::storage::SessionStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Cached state of one chat.
struct EntryState {
    session: ChatSession,
    /// Newest messages in ascending seq order.
    messages: VecDeque<MessageRecord>,
    /// Seqs of messages not yet durable. Always the newest messages.
    pending: BTreeSet<u64>,
    /// Whether `messages` holds every message the chat has.
    complete: bool,
    next_seq: u64,
    /// Set under the chat lock when the entry leaves the cache.
    evicted: bool,
}

impl EntryState {
    fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.messages.binary_search_by_key(&seq, |m| m.seq).ok()
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.message_id == *id)
    }

    /// Number of trailing messages that only exist in memory.
    fn unflushed_tail(&self) -> usize {
        self.messages
            .iter()
            .rev()
            .take_while(|m| self.pending.contains(&m.seq))
            .count()
    }

    fn push(&mut self, record: MessageRecord, pending: bool, window: usize) {
        if pending {
            self.pending.insert(record.seq);
        }
        self.messages.push_back(record);

        while self.messages.len() > window {
            match self.messages.front() {
                Some(oldest) if !self.pending.contains(&oldest.seq) => {
                    self.messages.pop_front();
                    self.complete = false;
                }
                _ => break,
            }
        }
    }
}

type ChatEntry = AsyncMutex<EntryState>;

#[derive(Clone)]
enum LoadState {
    Pending,
    Loaded,
    Failed(Error),
}

enum Slot {
    Loading(watch::Receiver<LoadState>),
    Resident(Arc<ChatEntry>),
}

enum Lookup {
    Hit(Arc<ChatEntry>),
    Wait(watch::Receiver<LoadState>),
    Load(watch::Sender<LoadState>),
}

/// Removes an abandoned `Loading` slot so waiters retry instead of hanging.
struct LoadingGuard<'a> {
    slots: &'a Mutex<HashMap<ChatId, Slot>>,
    chat_id: ChatId,
    armed: bool,
}

impl LoadingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock();
        if matches!(slots.get(&self.chat_id), Some(Slot::Loading(_))) {
            slots.remove(&self.chat_id);
        }
    }
}

/// Outcome of an inbound protocol envelope.
#[derive(Debug)]
pub enum Accepted {
    /// A new chat message, now cached (and durable under write-through).
    Stored(MessageRecord),
    /// A chat message that was already known. Nothing changed.
    Duplicate(MessageId),
    /// Any other verified payload, handed back to the host.
    Control(VerifiedEnvelope),
}

/// Snapshot of a resident chat.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    /// Chat configuration.
    pub session: ChatSession,
    /// Messages held in memory.
    pub cached_messages: usize,
    /// Messages not yet persisted.
    pub unflushed_messages: usize,
}

/// The chat cache and sync engine.
pub struct ChatEngine {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    slots: Mutex<HashMap<ChatId, Slot>>,
    lru: Mutex<LruList<ChatId>>,
    admission: AsyncMutex<()>,
}

impl ChatEngine {
    /// Create an engine on the wall clock.
    pub fn new(store: Arc<dyn SessionStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            capacity = config.cache_capacity.get(),
            window = config.message_window,
            policy = ?config.write_policy,
            "chat engine ready"
        );
        Self {
            store,
            clock,
            config,
            slots: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruList::new()),
            admission: AsyncMutex::new(()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a chat, or return the existing one for the same participants.
    ///
    /// The chat is not loaded into the cache until first used.
    pub async fn create_chat(
        &self,
        participants: &[UserId],
        config: ChatConfig,
    ) -> Result<ChatSession> {
        if participants.is_empty() {
            return Err(Error::InvalidConfig("a chat needs at least one participant".into()));
        }
        let session = self.store.create_session(participants, &config).await?;
        info!(
            chat_id = %session.chat_id,
            participants = session.participant_ids.len(),
            algorithm = %session.encryption_type,
            "chat created"
        );
        Ok(session)
    }

    /// Return a chat's configuration, loading it into the cache if needed.
    ///
    /// Concurrent calls for the same uncached chat share one load.
    pub async fn get_or_load(&self, chat_id: ChatId) -> Result<ChatSession> {
        Ok(self.lock_chat(chat_id).await?.session.clone())
    }

    /// Encrypt and append a message.
    ///
    /// RSA-OAEP chats get a key pair on their first message, sealed under
    /// `password`.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        sender: UserId,
        plaintext: &[u8],
        password: &str,
    ) -> Result<MessageRecord> {
        let mut state = self.lock_chat(chat_id).await?;
        if !state.session.has_participant(sender) {
            return Err(Error::NotFound(format!("user {} in chat {}", sender, chat_id)));
        }

        let algorithm = state.session.encryption_type;
        let recipient = if algorithm.is_asymmetric() {
            Some(self.chat_public_key(chat_id, &mut state, password).await?)
        } else {
            None
        };

        let body = Zeroizing::new(plaintext.to_vec());
        let secret = Zeroizing::new(password.to_owned());
        let envelope = tokio::task::spawn_blocking(move || {
            encrypt(&body, &secret, algorithm, recipient.as_ref())
        })
        .await??;

        let (created_at, delete_at) = self.stamp(&state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let record = MessageRecord {
            message_id: generate_message_id(),
            chat_id,
            sender_id: sender,
            envelope,
            created_at,
            delete_at,
            read_flag: false,
            seq,
        };

        self.commit(chat_id, &mut state, record.clone()).await?;
        debug!(chat_id = %chat_id, message_id = %record.message_id, seq, "message appended");
        Ok(record)
    }

    /// Fetch and decrypt a page of messages, oldest first.
    ///
    /// Expired messages are never returned, even before the sweep deletes
    /// them. Each message carries its own decryption outcome.
    pub async fn get_messages(
        &self,
        chat_id: ChatId,
        password: &str,
        range: MessageRange,
    ) -> Result<Vec<DecryptedMessage>> {
        let (records, key_material) = {
            let state = self.lock_chat(chat_id).await?;
            let records = self.page(chat_id, &state, range).await?;
            (records, state.session.key_material.clone())
        };

        let now = self.clock.now();
        let records: Vec<MessageRecord> =
            records.into_iter().filter(|m| !m.is_expired(now)).collect();
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let secret = Zeroizing::new(password.to_owned());
        let decrypted = tokio::task::spawn_blocking(move || {
            let needs_keypair = records.iter().any(|m| m.envelope.algorithm().is_asymmetric());
            let keypair: Option<Result<ChatKeyPair>> = needs_keypair.then(|| match &key_material {
                Some(sealed) => sealed.open(&secret),
                None => Err(Error::InvalidKey("chat has no key pair".into())),
            });

            records
                .into_iter()
                .map(|record| {
                    let plaintext = match &keypair {
                        Some(Ok(pair)) if record.envelope.algorithm().is_asymmetric() => {
                            decrypt(&record.envelope, &secret, Some(pair))
                        }
                        Some(Err(e)) if record.envelope.algorithm().is_asymmetric() => {
                            Err(e.clone())
                        }
                        _ => decrypt(&record.envelope, &secret, None),
                    };
                    DecryptedMessage { record, plaintext }
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let failed = decrypted.iter().filter(|m| m.plaintext.is_err()).count();
        if failed > 0 {
            warn!(chat_id = %chat_id, failed, "messages failed to decrypt");
        }
        Ok(decrypted)
    }

    /// Delete every message whose `delete_at` has passed, from cache and
    /// store. Returns how many were removed.
    ///
    /// Uses one `now` for the whole pass and locks one chat at a time.
    /// Running it again removes nothing new.
    pub async fn cleanup_expired_messages(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut expired: HashMap<ChatId, Vec<MessageId>> = HashMap::new();
        for (chat_id, id) in self.store.expired_messages(now).await? {
            expired.entry(chat_id).or_default().push(id);
        }

        let mut removed = 0;
        for (chat_id, entry) in self.resident_entries() {
            let mut state = entry.lock().await;
            if state.evicted {
                continue;
            }

            let mut durable = expired.remove(&chat_id).unwrap_or_default();
            durable.extend(
                state
                    .messages
                    .iter()
                    .filter(|m| m.is_expired(now) && !state.pending.contains(&m.seq))
                    .map(|m| m.message_id),
            );
            if !durable.is_empty() {
                removed += self.store.delete_messages(&durable).await?;
            }

            let unflushed = state.pending.len();
            let EntryState { messages, pending, .. } = &mut *state;
            messages.retain(|m| {
                let keep = !m.is_expired(now);
                if !keep {
                    pending.remove(&m.seq);
                }
                keep
            });
            removed += unflushed - state.pending.len();
        }

        let rest: Vec<MessageId> = expired.into_values().flatten().collect();
        if !rest.is_empty() {
            removed += self.store.delete_messages(&rest).await?;
        }

        if removed > 0 {
            info!(removed, "expired messages deleted");
        }
        Ok(removed)
    }

    /// Mark messages not sent by `reader` as read. Returns how many changed.
    pub async fn mark_as_read(&self, chat_id: ChatId, reader: UserId) -> Result<usize> {
        let mut state = self.lock_chat(chat_id).await?;
        let mut changed = self.store.mark_read(chat_id, reader).await?;

        let EntryState { messages, pending, .. } = &mut *state;
        for m in messages.iter_mut().filter(|m| m.sender_id != reader && !m.read_flag) {
            m.read_flag = true;
            if pending.contains(&m.seq) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Configuration and cache occupancy of a chat.
    pub async fn chat_info(&self, chat_id: ChatId) -> Result<ChatInfo> {
        let state = self.lock_chat(chat_id).await?;
        Ok(ChatInfo {
            session: state.session.clone(),
            cached_messages: state.messages.len(),
            unflushed_messages: state.pending.len(),
        })
    }

    /// Switch a chat's algorithm.
    ///
    /// Only allowed while the chat has no messages, since existing envelopes
    /// are never re-encrypted.
    pub async fn update_encryption(&self, chat_id: ChatId, algorithm: AlgorithmId) -> Result<()> {
        let mut state = self.lock_chat(chat_id).await?;
        if state.session.encryption_type == algorithm {
            return Ok(());
        }

        let has_messages = !state.messages.is_empty()
            || (!state.complete
                && !self
                    .store
                    .load_messages(chat_id, MessageRange::latest(1))
                    .await?
                    .is_empty());
        if has_messages {
            return Err(Error::InvalidConfig(
                "cannot change the algorithm of a chat that has messages".into(),
            ));
        }

        let update = SessionUpdate {
            encryption_type: Some(algorithm),
            ..Default::default()
        };
        self.store.update_session_config(chat_id, &update).await?;
        state.session.apply(&update);
        info!(chat_id = %chat_id, algorithm = %algorithm, "chat algorithm changed");
        Ok(())
    }

    /// Chats `user` takes part in, newest activity first.
    ///
    /// Unflushed messages of resident chats count towards the unread total
    /// and the newest message time.
    pub async fn user_chats(&self, user: UserId, include_hidden: bool) -> Result<Vec<ChatListing>> {
        let mut chats = self.store.list_chats(user, include_hidden).await?;
        for listing in &mut chats {
            let Some(entry) = self.resident(listing.session.chat_id) else {
                continue;
            };
            let state = entry.lock().await;
            if state.evicted {
                continue;
            }
            listing.session = state.session.clone();
            for m in state.messages.iter().filter(|m| state.pending.contains(&m.seq)) {
                if m.sender_id != user && !m.read_flag {
                    listing.unread_count += 1;
                }
                listing.last_message_at = listing.last_message_at.max(Some(m.created_at));
            }
        }
        sort_listings(&mut chats);
        debug!(user = %user, chats = chats.len(), include_hidden, "chats listed");
        Ok(chats)
    }

    /// Hide or unhide a chat for one participant, then drop it from the
    /// cache so the next access reloads it.
    pub async fn hide_chat(&self, chat_id: ChatId, user: UserId, hide: bool) -> Result<()> {
        self.store.set_hidden(chat_id, user, hide).await?;
        let evicted = {
            let _admission = self.admission.lock().await;
            self.evict_entry(chat_id).await?
        };
        info!(chat_id = %chat_id, user = %user, hide, evicted, "chat visibility changed");
        Ok(())
    }

    /// Change the auto-delete window for future messages. 0 disables expiry.
    pub async fn set_auto_delete(&self, chat_id: ChatId, hours: u32) -> Result<()> {
        let mut state = self.lock_chat(chat_id).await?;
        let update = SessionUpdate {
            auto_delete_hours: Some(hours),
            ..Default::default()
        };
        self.store.update_session_config(chat_id, &update).await?;
        state.session.apply(&update);
        info!(chat_id = %chat_id, hours, "auto-delete changed");
        Ok(())
    }

    /// Persist a chat's unflushed messages. Returns how many were written.
    pub async fn flush(&self, chat_id: ChatId) -> Result<usize> {
        let Some(entry) = self.resident(chat_id) else {
            return Ok(0);
        };
        let mut state = entry.lock().await;
        if state.evicted {
            return Ok(0);
        }
        self.flush_locked(chat_id, &mut state).await
    }

    /// Flush every dirty resident chat.
    ///
    /// All chats are attempted; the first failure is returned afterwards.
    pub async fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        let mut first_error = None;
        for (chat_id, entry) in self.resident_entries() {
            let mut state = entry.lock().await;
            if state.evicted || !state.is_dirty() {
                continue;
            }
            match self.flush_locked(chat_id, &mut state).await {
                Ok(n) => flushed += n,
                Err(e) => {
                    warn!(chat_id = %chat_id, error = %e, "flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Flush and drop a chat from the cache. Returns whether it was resident.
    pub async fn evict(&self, chat_id: ChatId) -> Result<bool> {
        let _admission = self.admission.lock().await;
        self.evict_entry(chat_id).await
    }

    /// Flush everything before the host stops.
    pub async fn shutdown(&self) -> Result<usize> {
        let flushed = self.flush_all().await?;
        info!(flushed, resident = self.resident_count(), "chat engine shut down");
        Ok(flushed)
    }

    /// Number of resident chats.
    pub fn resident_count(&self) -> usize {
        self.lru.lock().len()
    }

    /// Whether a chat is resident.
    pub fn is_resident(&self, chat_id: ChatId) -> bool {
        self.resident(chat_id).is_some()
    }

    /// Whether a resident chat has unflushed messages.
    pub async fn is_dirty(&self, chat_id: ChatId) -> bool {
        match self.resident(chat_id) {
            Some(entry) => entry.lock().await.is_dirty(),
            None => false,
        }
    }

    /// Verify an inbound envelope and apply it.
    ///
    /// Chat messages are stored (or recognized as duplicates); every other
    /// payload is returned to the host untouched.
    pub async fn accept_envelope(&self, bytes: &[u8]) -> Result<Accepted> {
        let verified = ProtocolEnvelope::open(bytes, &self.config.signing_secret)?;

        if let ProtocolPayload::ChatMessage(payload) = verified.payload() {
            return self.receive_message(payload).await;
        }
        if let ProtocolPayload::Error(report) = verified.payload() {
            warn!(
                code = %sanitize_for_log(&report.code),
                message = %sanitize_for_log(&report.message),
                "peer reported an error"
            );
        }
        Ok(Accepted::Control(verified))
    }

    /// Store a chat message received from a peer.
    ///
    /// A message id that is already known is acknowledged as a duplicate.
    /// Timestamps come from this engine's clock and expiry from this chat's
    /// auto-delete window, whatever the peer sent.
    pub async fn receive_message(&self, payload: &ChatMessagePayload) -> Result<Accepted> {
        let chat_id = ChatId(payload.chat_id);
        let message_id = MessageId(payload.message_id);
        let sender = UserId(payload.sender_id);

        let mut state = self.lock_chat(chat_id).await?;
        if !state.session.has_participant(sender) {
            return Err(Error::NotFound(format!("user {} in chat {}", sender, chat_id)));
        }
        if state.contains(&message_id)
            || (!state.complete && self.store.message_exists(&message_id).await?)
        {
            debug!(chat_id = %chat_id, message_id = %message_id, "duplicate message ignored");
            return Ok(Accepted::Duplicate(message_id));
        }

        let mut record = MessageRecord::from_payload(payload, state.next_seq)?;
        (record.created_at, record.delete_at) = self.stamp(&state);
        state.next_seq += 1;
        self.commit(chat_id, &mut state, record.clone()).await?;
        debug!(chat_id = %chat_id, message_id = %message_id, seq = record.seq, "message received");
        Ok(Accepted::Stored(record))
    }

    /// Sign a stored message for delivery to peers.
    pub fn outbound_envelope(&self, record: &MessageRecord) -> Result<ProtocolEnvelope> {
        ProtocolEnvelope::sign_payload(&record.to_payload(), &self.config.signing_secret)
    }

    /// Resolve a chat to its cache entry, loading it at most once at a time.
    async fn entry(&self, chat_id: ChatId) -> Result<Arc<ChatEntry>> {
        loop {
            let lookup = {
                let mut slots = self.slots.lock();
                match slots.get(&chat_id) {
                    Some(Slot::Resident(entry)) => Lookup::Hit(Arc::clone(entry)),
                    Some(Slot::Loading(rx)) => Lookup::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(LoadState::Pending);
                        slots.insert(chat_id, Slot::Loading(rx));
                        Lookup::Load(tx)
                    }
                }
            };

            match lookup {
                Lookup::Hit(entry) => {
                    self.lru.lock().promote(&chat_id);
                    return Ok(entry);
                }
                Lookup::Wait(mut rx) => {
                    // A dropped sender means the loader was cancelled.
                    if rx.changed().await.is_err() {
                        continue;
                    }
                    let outcome = rx.borrow().clone();
                    if let LoadState::Failed(e) = outcome {
                        return Err(e);
                    }
                }
                Lookup::Load(tx) => return self.load(chat_id, tx).await,
            }
        }
    }

    async fn load(
        &self,
        chat_id: ChatId,
        done: watch::Sender<LoadState>,
    ) -> Result<Arc<ChatEntry>> {
        let guard = LoadingGuard {
            slots: &self.slots,
            chat_id,
            armed: true,
        };

        match self.load_entry(chat_id).await {
            Ok(entry) => {
                guard.disarm();
                let _ = done.send(LoadState::Loaded);
                Ok(entry)
            }
            Err(e) => {
                drop(guard);
                debug!(chat_id = %chat_id, error = %e, "chat load failed");
                let _ = done.send(LoadState::Failed(e.clone()));
                Err(e)
            }
        }
    }

    async fn load_entry(&self, chat_id: ChatId) -> Result<Arc<ChatEntry>> {
        let session = self.store.load_session(chat_id).await?;
        let window = self.config.message_window;
        let fetch = window.max(1);
        let mut messages: VecDeque<MessageRecord> = self
            .store
            .load_messages(chat_id, MessageRange::latest(fetch))
            .await?
            .into();
        let next_seq = messages.back().map_or(0, |m| m.seq + 1);
        let mut complete = messages.len() < fetch;
        while messages.len() > window {
            messages.pop_front();
            complete = false;
        }
        let cached = messages.len();

        let entry = Arc::new(AsyncMutex::new(EntryState {
            session,
            messages,
            pending: BTreeSet::new(),
            complete,
            next_seq,
            evicted: false,
        }));

        let _admission = self.admission.lock().await;
        self.make_room().await?;
        self.slots
            .lock()
            .insert(chat_id, Slot::Resident(Arc::clone(&entry)));
        self.lru.lock().touch(chat_id);
        debug!(chat_id = %chat_id, cached, "chat loaded");
        Ok(entry)
    }

    /// Evict least recently used chats until one slot is free.
    /// Caller holds `admission`.
    async fn make_room(&self) -> Result<()> {
        let capacity = self.config.cache_capacity.get();
        let candidates: Vec<ChatId> = {
            let lru = self.lru.lock();
            if lru.len() < capacity {
                return Ok(());
            }
            lru.iter().collect()
        };

        let mut last_error = None;
        for victim in candidates {
            match self.evict_entry(victim).await {
                Ok(_) => {
                    if self.resident_count() < capacity {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(chat_id = %victim, error = %e, "eviction skipped, flush failed");
                    last_error = Some(e);
                }
            }
        }

        if self.resident_count() < capacity {
            return Ok(());
        }
        Err(last_error
            .unwrap_or_else(|| Error::StorageUnavailable("no evictable chat".into())))
    }

    /// Caller holds `admission`.
    async fn evict_entry(&self, chat_id: ChatId) -> Result<bool> {
        let Some(entry) = self.resident(chat_id) else {
            self.lru.lock().remove(&chat_id);
            return Ok(false);
        };

        let mut state = entry.lock().await;
        if state.evicted {
            return Ok(false);
        }
        let flushed = self.flush_locked(chat_id, &mut state).await?;
        state.evicted = true;
        self.slots.lock().remove(&chat_id);
        self.lru.lock().remove(&chat_id);
        info!(chat_id = %chat_id, flushed, "chat evicted");
        Ok(true)
    }

    /// Append pending messages oldest first. Each one leaves the pending
    /// set only once its append committed.
    async fn flush_locked(&self, chat_id: ChatId, state: &mut EntryState) -> Result<usize> {
        let mut flushed = 0;
        while let Some(&seq) = state.pending.first() {
            if let Some(pos) = state.position(seq) {
                let record = state.messages[pos].clone();
                self.store.append_message(chat_id, &record).await?;
                flushed += 1;
            }
            state.pending.remove(&seq);
        }
        if flushed > 0 {
            debug!(chat_id = %chat_id, flushed, "pending messages flushed");
        }
        Ok(flushed)
    }

    /// Creation time and expiry for a message entering the chat now.
    fn stamp(&self, state: &EntryState) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
        let created_at = truncate_millis(self.clock.now());
        let delete_at = state
            .session
            .ttl()
            .and_then(|ttl| created_at.checked_add_signed(ttl));
        (created_at, delete_at)
    }

    async fn commit(
        &self,
        chat_id: ChatId,
        state: &mut EntryState,
        record: MessageRecord,
    ) -> Result<()> {
        let window = self.config.message_window;
        match self.config.write_policy {
            WritePolicy::WriteThrough => {
                self.store.append_message(chat_id, &record).await?;
                state.push(record, false, window);
            }
            WritePolicy::WriteBack => state.push(record, true, window),
        }
        Ok(())
    }

    /// Serve a page from memory when possible, otherwise combine unflushed
    /// messages with a store query.
    async fn page(
        &self,
        chat_id: ChatId,
        state: &EntryState,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>> {
        let cached = state.messages.len();
        let end = range.offset.saturating_add(range.limit);
        if state.complete || end <= cached {
            let hi = cached.saturating_sub(range.offset);
            let lo = cached.saturating_sub(end);
            return Ok(state.messages.range(lo..hi).cloned().collect());
        }

        let unflushed = state.unflushed_tail();
        let mut page = Vec::new();
        if end > unflushed {
            let skip = range.offset.saturating_sub(unflushed);
            let limit = end - unflushed - skip;
            page = self
                .store
                .load_messages(chat_id, MessageRange { offset: skip, limit })
                .await?;
        }
        if range.offset < unflushed {
            let hi = cached - range.offset;
            let lo = cached - end.min(unflushed);
            page.extend(state.messages.range(lo..hi).cloned());
        }
        Ok(page)
    }

    async fn chat_public_key(
        &self,
        chat_id: ChatId,
        state: &mut EntryState,
        password: &str,
    ) -> Result<ChatPublicKey> {
        if let Some(sealed) = &state.session.key_material {
            return sealed.public_key();
        }

        let secret = Zeroizing::new(password.to_owned());
        let (public, sealed) = tokio::task::spawn_blocking(move || -> Result<_> {
            let pair = ChatKeyPair::generate()?;
            let sealed = pair.seal(&secret)?;
            Ok((pair.public_key().clone(), sealed))
        })
        .await??;

        let update = SessionUpdate {
            key_material: Some(sealed),
            ..Default::default()
        };
        self.store.update_session_config(chat_id, &update).await?;
        state.session.apply(&update);
        info!(chat_id = %chat_id, "chat key pair generated");
        Ok(public)
    }

    async fn lock_chat(&self, chat_id: ChatId) -> Result<OwnedMutexGuard<EntryState>> {
        loop {
            let entry = self.entry(chat_id).await?;
            let state = entry.lock_owned().await;
            if !state.evicted {
                return Ok(state);
            }
        }
    }

    fn resident(&self, chat_id: ChatId) -> Option<Arc<ChatEntry>> {
        match self.slots.lock().get(&chat_id) {
            Some(Slot::Resident(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    fn resident_entries(&self) -> Vec<(ChatId, Arc<ChatEntry>)> {
        self.slots
            .lock()
            .iter()
            .filter_map(|(chat_id, slot)| match slot {
                Slot::Resident(entry) => Some((*chat_id, Arc::clone(entry))),
                Slot::Loading(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningSecret;
    use crate::messaging::ManualClock;
    use crate::storage::MemoryStore;
    use std::num::NonZeroUsize;

    const PASSWORD: &str = "secret123";

    fn config(capacity: usize, window: usize, write_policy: WritePolicy) -> EngineConfig {
        EngineConfig {
            cache_capacity: NonZeroUsize::new(capacity).expect("capacity"),
            message_window: window,
            write_policy,
            signing_secret: SigningSecret::new(vec![7u8; 32]).expect("secret"),
            ..Default::default()
        }
    }

    fn engine(config: EngineConfig) -> (Arc<MemoryStore>, Arc<ManualClock>, ChatEngine) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let engine = ChatEngine::with_clock(store.clone(), config, clock.clone());
        (store, clock, engine)
    }

    async fn chat(engine: &ChatEngine, users: &[i64]) -> ChatId {
        let users: Vec<UserId> = users.iter().copied().map(UserId).collect();
        engine
            .create_chat(&users, ChatConfig::default())
            .await
            .expect("create")
            .chat_id
    }

    #[tokio::test]
    async fn test_send_then_read() {
        let (store, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;

        let sent = engine
            .send_message(chat_id, UserId(1), b"hola", PASSWORD)
            .await
            .expect("send");
        assert_eq!(sent.seq, 0);
        assert!(store.contains_message(&sent.message_id));

        let page = engine
            .get_messages(chat_id, PASSWORD, MessageRange::default())
            .await
            .expect("read");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text(), Some("hola"));
    }

    #[tokio::test]
    async fn test_non_participant_cannot_send() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;
        let err = engine
            .send_message(chat_id, UserId(3), b"hola", PASSWORD)
            .await
            .expect_err("outsider");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_chat_is_not_found() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        assert!(matches!(
            engine.get_or_load(ChatId(42)).await,
            Err(Error::NotFound(_))
        ));
        assert!(!engine.is_resident(ChatId(42)));
        assert_eq!(engine.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_window_trims_and_pages_reach_store() {
        let (store, _, engine) = engine(config(4, 3, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;
        for i in 0..6 {
            engine
                .send_message(chat_id, UserId(1), format!("m{}", i).as_bytes(), PASSWORD)
                .await
                .expect("send");
        }
        assert_eq!(engine.chat_info(chat_id).await.expect("info").cached_messages, 3);

        let loads = store.message_loads();
        let newest = engine
            .get_messages(chat_id, PASSWORD, MessageRange::latest(2))
            .await
            .expect("read");
        let texts: Vec<_> = newest.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m4", "m5"]);
        assert_eq!(store.message_loads(), loads);

        let older = engine
            .get_messages(chat_id, PASSWORD, MessageRange { offset: 2, limit: 3 })
            .await
            .expect("read");
        let texts: Vec<_> = older.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
        assert_eq!(store.message_loads(), loads + 1);
    }

    #[tokio::test]
    async fn test_write_back_pages_mix_memory_and_store() {
        let (_, _, engine) = engine(config(4, 2, WritePolicy::WriteBack));
        let chat_id = chat(&engine, &[1, 2]).await;
        for i in 0..3 {
            engine
                .send_message(chat_id, UserId(1), format!("m{}", i).as_bytes(), PASSWORD)
                .await
                .expect("send");
        }
        engine.flush(chat_id).await.expect("flush");
        engine
            .send_message(chat_id, UserId(2), b"m3", PASSWORD)
            .await
            .expect("send");

        let page = engine
            .get_messages(chat_id, PASSWORD, MessageRange::latest(4))
            .await
            .expect("read");
        let texts: Vec<_> = page.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_seq_continues_after_reload() {
        let (_, _, engine) = engine(config(1, 10, WritePolicy::WriteThrough));
        let a = chat(&engine, &[1]).await;
        let b = chat(&engine, &[2]).await;

        engine.send_message(a, UserId(1), b"one", PASSWORD).await.expect("send");
        engine.get_or_load(b).await.expect("load b");
        assert!(!engine.is_resident(a));

        let second = engine
            .send_message(a, UserId(1), b"two", PASSWORD)
            .await
            .expect("send");
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_entry_dirty() {
        let (store, _, engine) = engine(config(4, 10, WritePolicy::WriteBack));
        let chat_id = chat(&engine, &[1]).await;
        engine
            .send_message(chat_id, UserId(1), b"hola", PASSWORD)
            .await
            .expect("send");

        store.set_available(false);
        assert!(engine.flush(chat_id).await.expect_err("offline").is_retryable());
        assert!(engine.is_dirty(chat_id).await);

        store.set_available(true);
        assert_eq!(engine.flush(chat_id).await.expect("flush"), 1);
        assert!(!engine.is_dirty(chat_id).await);
        assert_eq!(store.message_count(chat_id), 1);
    }

    #[tokio::test]
    async fn test_update_encryption_only_when_empty() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;

        engine
            .update_encryption(chat_id, AlgorithmId::ChaCha20Poly1305)
            .await
            .expect("switch");
        assert_eq!(
            engine.get_or_load(chat_id).await.expect("load").encryption_type,
            AlgorithmId::ChaCha20Poly1305
        );

        engine
            .send_message(chat_id, UserId(1), b"hola", PASSWORD)
            .await
            .expect("send");
        let err = engine
            .update_encryption(chat_id, AlgorithmId::Aes256Gcm)
            .await
            .expect_err("has messages");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_mark_as_read_counts_other_senders() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteBack));
        let chat_id = chat(&engine, &[1, 2]).await;
        engine.send_message(chat_id, UserId(1), b"a", PASSWORD).await.expect("send");
        engine.send_message(chat_id, UserId(2), b"b", PASSWORD).await.expect("send");

        assert_eq!(engine.mark_as_read(chat_id, UserId(2)).await.expect("read"), 1);
        assert_eq!(engine.mark_as_read(chat_id, UserId(2)).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_unflushed_expired_messages() {
        let (store, clock, engine) = engine(config(4, 10, WritePolicy::WriteBack));
        let chat_id = chat(&engine, &[1]).await;
        engine.set_auto_delete(chat_id, 1).await.expect("ttl");
        engine.send_message(chat_id, UserId(1), b"gone", PASSWORD).await.expect("send");

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(engine.cleanup_expired_messages().await.expect("cleanup"), 1);
        assert!(!engine.is_dirty(chat_id).await);
        assert_eq!(engine.flush(chat_id).await.expect("flush"), 0);
        assert_eq!(store.appends(), 0);
        assert_eq!(engine.cleanup_expired_messages().await.expect("cleanup"), 0);
    }

    #[tokio::test]
    async fn test_accept_envelope_stores_then_deduplicates() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;
        let sent = engine
            .send_message(chat_id, UserId(1), b"hola", PASSWORD)
            .await
            .expect("send");

        let mut record = sent.clone();
        record.message_id = generate_message_id();
        let wire = engine.outbound_envelope(&record).expect("sign").to_bytes();

        match engine.accept_envelope(&wire).await.expect("accept") {
            Accepted::Stored(stored) => {
                assert_eq!(stored.message_id, record.message_id);
                assert_eq!(stored.seq, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            engine.accept_envelope(&wire).await.expect("accept"),
            Accepted::Duplicate(id) if id == record.message_id
        ));
    }

    #[tokio::test]
    async fn test_accept_envelope_hands_back_control_payloads() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let report = crate::protocol::ErrorPayload {
            code: "rate_limited".into(),
            message: "slow down".into(),
        };
        let wire = ProtocolEnvelope::sign_payload(&report, &engine.config().signing_secret)
            .expect("sign")
            .to_bytes();

        match engine.accept_envelope(&wire).await.expect("accept") {
            Accepted::Control(verified) => {
                assert!(matches!(verified.payload(), ProtocolPayload::Error(p) if *p == report));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forged_envelope_is_rejected() {
        let (_, _, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let other = SigningSecret::new(vec![8u8; 32]).expect("secret");
        let report = crate::protocol::ErrorPayload {
            code: "x".into(),
            message: "y".into(),
        };
        let wire = ProtocolEnvelope::sign_payload(&report, &other)
            .expect("sign")
            .to_bytes();
        assert!(matches!(
            engine.accept_envelope(&wire).await,
            Err(Error::MalformedEnvelope)
        ));
    }

    #[tokio::test]
    async fn test_received_message_uses_local_clock_and_ttl() {
        let (_, clock, engine) = engine(config(4, 10, WritePolicy::WriteThrough));
        let chat_id = chat(&engine, &[1, 2]).await;
        engine.set_auto_delete(chat_id, 1).await.expect("ttl");
        let sent = engine
            .send_message(chat_id, UserId(1), b"hola", PASSWORD)
            .await
            .expect("send");

        let mut payload = sent.to_payload();
        payload.message_id = generate_message_id().0;
        payload.created_at = 0;
        payload.delete_at = None;

        clock.advance(chrono::Duration::minutes(5));
        let stored = match engine.receive_message(&payload).await.expect("receive") {
            Accepted::Stored(record) => record,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(stored.created_at, truncate_millis(clock.now()));
        assert_eq!(stored.delete_at, Some(stored.created_at + chrono::Duration::hours(1)));
        assert!(stored.created_at > sent.created_at);
    }

    #[tokio::test]
    async fn test_user_chats_include_unflushed_messages() {
        let (_, clock, engine) = engine(config(4, 10, WritePolicy::WriteBack));
        let older = chat(&engine, &[1, 3]).await;
        let newer = chat(&engine, &[1, 2]).await;

        engine.send_message(older, UserId(3), b"a", PASSWORD).await.expect("send");
        engine.flush(older).await.expect("flush");
        clock.advance(chrono::Duration::seconds(1));
        let latest = engine
            .send_message(newer, UserId(2), b"b", PASSWORD)
            .await
            .expect("send");
        assert!(engine.is_dirty(newer).await);

        let chats = engine.user_chats(UserId(1), false).await.expect("list");
        let ids: Vec<ChatId> = chats.iter().map(|l| l.session.chat_id).collect();
        assert_eq!(ids, vec![newer, older]);
        assert_eq!(chats[0].unread_count, 1);
        assert_eq!(chats[0].last_message_at, Some(latest.created_at));
        assert_eq!(chats[1].unread_count, 1);

        engine.mark_as_read(newer, UserId(1)).await.expect("read");
        let chats = engine.user_chats(UserId(1), false).await.expect("list");
        assert_eq!(chats[0].unread_count, 0);
        assert_eq!(chats[0].to_summary().chat_id, newer.0);
    }

    #[tokio::test]
    async fn test_hide_chat_flushes_evicts_and_filters() {
        let (store, _, engine) = engine(config(4, 10, WritePolicy::WriteBack));
        let chat_id = chat(&engine, &[1, 2]).await;
        engine.send_message(chat_id, UserId(1), b"a", PASSWORD).await.expect("send");

        engine.hide_chat(chat_id, UserId(1), true).await.expect("hide");
        assert!(!engine.is_resident(chat_id));
        assert_eq!(store.message_count(chat_id), 1);

        assert!(engine.user_chats(UserId(1), false).await.expect("list").is_empty());
        let all = engine.user_chats(UserId(1), true).await.expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].hidden);
        assert_eq!(engine.user_chats(UserId(2), false).await.expect("list").len(), 1);

        assert!(matches!(
            engine.hide_chat(chat_id, UserId(9), true).await,
            Err(Error::NotFound(_))
        ));
        engine.hide_chat(chat_id, UserId(1), false).await.expect("unhide");
        assert_eq!(engine.user_chats(UserId(1), false).await.expect("list").len(), 1);
    }
}
