//! SQLite persistence gateway.
//!
//! Messages are stored exactly as the cache holds them: canonical
//! encryption-envelope bytes, never plaintext. rusqlite is blocking, so
//! every call runs on tokio's blocking pool.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use super::SessionStore;
use crate::config::ChatConfig;
use crate::crypto::{AlgorithmId, EncryptionEnvelope, SealedKeyPair};
use crate::error::{Error, Result};
use crate::messaging::{
    normalize_participants, ChatId, ChatListing, ChatSession, MessageId, MessageRange,
    MessageRecord, SessionUpdate, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// SQLite-backed [`SessionStore`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StorageUnavailable(format!("failed to create directory: {}", e))
                })?;
            }
            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        conn.execute_batch(&CREATE_SCHEMA.replace('?', &SCHEMA_VERSION.to_string()))?;
        debug!(in_memory = config.in_memory, "sqlite store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&SqliteConfig {
            path: String::new(),
            in_memory: true,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::StorageUnavailable("lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("storage task failed: {}", e)))?
    }
}

fn participants_key(participants: &[UserId]) -> String {
    participants
        .iter()
        .map(|u| u.0.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn corrupt(what: &str) -> Error {
    Error::StorageUnavailable(format!("corrupt {} row", what))
}

fn not_found(chat_id: ChatId) -> Error {
    Error::NotFound(format!("chat {}", chat_id))
}

fn chat_exists(conn: &Connection, chat_id: ChatId) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM chats WHERE id = ?", params![chat_id.0], |_| Ok(()))
        .optional()?
        .is_some())
}

fn read_session(conn: &Connection, chat_id: ChatId) -> Result<ChatSession> {
    let row = conn
        .query_row(
            r#"SELECT participants, encryption_type, key_material, auto_delete_hours
               FROM chats WHERE id = ?"#,
            params![chat_id.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u8>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| not_found(chat_id))?;
    let (participants, algorithm, key_material, auto_delete_hours) = row;

    let participant_ids = participants
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map(UserId).map_err(|_| corrupt("chat")))
        .collect::<Result<Vec<_>>>()?;
    let encryption_type = AlgorithmId::from_byte(algorithm).ok_or_else(|| corrupt("chat"))?;
    let key_material = key_material
        .map(|bytes| SealedKeyPair::from_bytes(&bytes).map_err(|_| corrupt("chat")))
        .transpose()?;

    Ok(ChatSession {
        chat_id,
        participant_ids,
        encryption_type,
        key_material,
        auto_delete_hours,
    })
}

/// Raw message row before envelope and timestamp decoding.
type MessageRow = (i64, Vec<u8>, i64, i64, Vec<u8>, i64, Option<i64>, bool);

fn decode_message(row: MessageRow) -> Result<MessageRecord> {
    let (chat_id, message_id, seq, sender_id, envelope, created_at, delete_at, read_flag) = row;
    let time = |millis: i64| {
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| corrupt("message"))
    };

    Ok(MessageRecord {
        message_id: MessageId::from_slice(&message_id).ok_or_else(|| corrupt("message"))?,
        chat_id: ChatId(chat_id),
        sender_id: UserId(sender_id),
        envelope: EncryptionEnvelope::from_bytes(&envelope).map_err(|_| corrupt("message"))?,
        created_at: time(created_at)?,
        delete_at: delete_at.map(time).transpose()?,
        read_flag,
        seq: u64::try_from(seq).map_err(|_| corrupt("message"))?,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        participants: &[UserId],
        config: &ChatConfig,
    ) -> Result<ChatSession> {
        let participant_ids = normalize_participants(participants);
        let config = *config;
        self.with_conn(move |conn| {
            let key = participants_key(&participant_ids);
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM chats WHERE participants = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            let chat_id = match existing {
                Some(id) => ChatId(id),
                None => {
                    tx.execute(
                        r#"INSERT INTO chats
                           (participants, encryption_type, auto_delete_hours, created_at)
                           VALUES (?, ?, ?, ?)"#,
                        params![
                            key,
                            config.encryption_type.as_byte(),
                            config.auto_delete_hours,
                            Utc::now().timestamp_millis(),
                        ],
                    )?;
                    let chat_id = tx.last_insert_rowid();
                    let mut member =
                        tx.prepare("INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)")?;
                    for user in &participant_ids {
                        member.execute(params![chat_id, user.0])?;
                    }
                    ChatId(chat_id)
                }
            };
            let session = read_session(&tx, chat_id)?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    async fn load_session(&self, chat_id: ChatId) -> Result<ChatSession> {
        self.with_conn(move |conn| read_session(conn, chat_id)).await
    }

    async fn load_messages(
        &self,
        chat_id: ChatId,
        range: MessageRange,
    ) -> Result<Vec<MessageRecord>> {
        self.with_conn(move |conn| {
            if !chat_exists(conn, chat_id)? {
                return Err(not_found(chat_id));
            }
            let mut stmt = conn.prepare(
                r#"SELECT chat_id, message_id, seq, sender_id, envelope,
                          created_at, delete_at, read_flag
                   FROM messages
                   WHERE chat_id = ?
                   ORDER BY seq DESC
                   LIMIT ? OFFSET ?"#,
            )?;
            let rows = stmt
                .query_map(
                    params![
                        chat_id.0,
                        i64::try_from(range.limit).unwrap_or(i64::MAX),
                        i64::try_from(range.offset).unwrap_or(i64::MAX),
                    ],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )?
                .collect::<std::result::Result<Vec<MessageRow>, _>>()?;

            let mut messages = rows
                .into_iter()
                .map(decode_message)
                .collect::<Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn append_message(&self, chat_id: ChatId, record: &MessageRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            if !chat_exists(conn, chat_id)? {
                return Err(not_found(chat_id));
            }
            let seq = i64::try_from(record.seq).map_err(|_| corrupt("message"))?;
            conn.execute(
                r#"INSERT OR IGNORE INTO messages
                   (message_id, chat_id, seq, sender_id, envelope, created_at, delete_at, read_flag)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    record.message_id.as_bytes().as_slice(),
                    chat_id.0,
                    seq,
                    record.sender_id.0,
                    record.envelope.to_bytes(),
                    record.created_at.timestamp_millis(),
                    record.delete_at.map(|d| d.timestamp_millis()),
                    record.read_flag,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn message_exists(&self, id: &MessageId) -> Result<bool> {
        let id = *id;
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM messages WHERE message_id = ?",
                    params![id.as_bytes().as_slice()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<usize> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM messages WHERE message_id = ?")?;
                for id in &ids {
                    deleted += stmt.execute(params![id.as_bytes().as_slice()])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn update_session_config(&self, chat_id: ChatId, update: &SessionUpdate) -> Result<()> {
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            if !chat_exists(&tx, chat_id)? {
                return Err(not_found(chat_id));
            }
            if let Some(alg) = update.encryption_type {
                tx.execute(
                    "UPDATE chats SET encryption_type = ? WHERE id = ?",
                    params![alg.as_byte(), chat_id.0],
                )?;
            }
            if let Some(hours) = update.auto_delete_hours {
                tx.execute(
                    "UPDATE chats SET auto_delete_hours = ? WHERE id = ?",
                    params![hours, chat_id.0],
                )?;
            }
            if let Some(keys) = &update.key_material {
                tx.execute(
                    "UPDATE chats SET key_material = ? WHERE id = ?",
                    params![keys.to_bytes(), chat_id.0],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn expired_messages(&self, now: DateTime<Utc>) -> Result<Vec<(ChatId, MessageId)>> {
        let now = now.timestamp_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT chat_id, message_id FROM messages
                   WHERE delete_at IS NOT NULL AND delete_at <= ?"#,
            )?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(chat_id, id)| {
                    MessageId::from_slice(&id)
                        .map(|id| (ChatId(chat_id), id))
                        .ok_or_else(|| corrupt("message"))
                })
                .collect()
        })
        .await
    }

    async fn mark_read(&self, chat_id: ChatId, reader: UserId) -> Result<usize> {
        self.with_conn(move |conn| {
            if !chat_exists(conn, chat_id)? {
                return Err(not_found(chat_id));
            }
            Ok(conn.execute(
                r#"UPDATE messages SET read_flag = 1
                   WHERE chat_id = ? AND sender_id != ? AND read_flag = 0"#,
                params![chat_id.0, reader.0],
            )?)
        })
        .await
    }

    async fn list_chats(&self, user: UserId, include_hidden: bool) -> Result<Vec<ChatListing>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"SELECT cm.chat_id, cm.hidden, MAX(m.created_at),
                          COALESCE(SUM(m.sender_id != ?1 AND m.read_flag = 0), 0)
                   FROM chat_members cm
                   LEFT JOIN messages m ON m.chat_id = cm.chat_id
                   WHERE cm.user_id = ?1 AND (?2 OR cm.hidden = 0)
                   GROUP BY cm.chat_id, cm.hidden
                   ORDER BY MAX(m.created_at) IS NULL, MAX(m.created_at) DESC, cm.chat_id"#,
            )?;
            let rows = stmt
                .query_map(params![user.0, include_hidden], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(chat_id, hidden, last, unread)| -> Result<ChatListing> {
                    let last_message_at = last
                        .map(|millis| {
                            DateTime::<Utc>::from_timestamp_millis(millis)
                                .ok_or_else(|| corrupt("message"))
                        })
                        .transpose()?;
                    Ok(ChatListing {
                        session: read_session(conn, ChatId(chat_id))?,
                        hidden,
                        unread_count: usize::try_from(unread).map_err(|_| corrupt("message"))?,
                        last_message_at,
                    })
                })
                .collect()
        })
        .await
    }

    async fn set_hidden(&self, chat_id: ChatId, user: UserId, hide: bool) -> Result<()> {
        self.with_conn(move |conn| {
            if !chat_exists(conn, chat_id)? {
                return Err(not_found(chat_id));
            }
            let changed = conn.execute(
                "UPDATE chat_members SET hidden = ? WHERE chat_id = ? AND user_id = ?",
                params![hide, chat_id.0, user.0],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("user {} in chat {}", user, chat_id)));
            }
            Ok(())
        })
        .await
    }
}
