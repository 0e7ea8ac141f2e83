/// SQL DDL for the courier database.
/// Timestamps are fixed-width RFC 3339 UTC text, so `<`, `>` and `MAX()`
/// compare chronologically.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS windows (
    conversation_id TEXT NOT NULL,
    channel_type TEXT NOT NULL,
    contact_id TEXT,
    owner_id TEXT,
    last_customer_message_at TEXT NOT NULL,
    window_expires_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, channel_type)
);

CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    channel_type TEXT NOT NULL,
    recipient TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'waiting',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    claimed_until TEXT,
    created_at TEXT NOT NULL,
    last_attempt_at TEXT,
    updated_at TEXT NOT NULL,
    CHECK (attempts >= 0 AND attempts <= max_attempts)
);

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    channel_type TEXT NOT NULL,
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL,
    parameter_slots TEXT NOT NULL DEFAULT '[]',
    synced_at TEXT NOT NULL,
    UNIQUE (channel_type, name, language)
);

CREATE INDEX IF NOT EXISTS idx_windows_status_expiry ON windows(status, window_expires_at);
CREATE INDEX IF NOT EXISTS idx_queue_key_status ON queue_entries(conversation_id, channel_type, status, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_status_created ON queue_entries(status, created_at);
CREATE INDEX IF NOT EXISTS idx_templates_lookup ON templates(channel_type, kind, status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
