//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 2;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- Chats: one row per participant set
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    participants TEXT NOT NULL UNIQUE,
    encryption_type INTEGER NOT NULL,
    key_material BLOB,
    auto_delete_hours INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Per-participant view state
CREATE TABLE IF NOT EXISTS chat_members (
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    hidden INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (chat_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_members_user ON chat_members(user_id);

-- Messages: ciphertext only, ordered by per-chat seq
CREATE TABLE IF NOT EXISTS messages (
    message_id BLOB PRIMARY KEY,
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    sender_id INTEGER NOT NULL,
    envelope BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    delete_at INTEGER,
    read_flag INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_seq ON messages(chat_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_delete_at ON messages(delete_at);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;
