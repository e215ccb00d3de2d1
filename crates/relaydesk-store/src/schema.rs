/// SQL DDL for the relaydesk session store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'assistant',
    status TEXT NOT NULL DEFAULT 'active',
    assigned_agent TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    CHECK ((mode = 'human' AND assigned_agent IS NOT NULL)
        OR (mode = 'assistant' AND assigned_agent IS NULL))
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    sequence INTEGER NOT NULL,
    sender TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    UNIQUE (session_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, last_activity);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(assigned_agent);
CREATE INDEX IF NOT EXISTS idx_sessions_pool ON sessions(status, mode, last_activity);
CREATE INDEX IF NOT EXISTS idx_messages_session_seq ON messages(session_id, sequence);

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
