//! DDL for the local store: facts, pending deletes, meta, WAL-style
//! journaling. Schema is kept minimal and explicit.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
  id TEXT NOT NULL,
  scope TEXT NOT NULL,
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  confidence REAL NOT NULL DEFAULT 1.0,
  source_session TEXT,
  created TEXT NOT NULL,
  last_confirmed TEXT NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  dirty INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS pending_deletes (
  key TEXT PRIMARY KEY,
  deleted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shared_conversation_imports (
  share_id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL,
  imported_at TEXT NOT NULL
);
"#;
