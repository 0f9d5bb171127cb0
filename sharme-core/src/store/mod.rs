//! Local store: fact table, dirty flags, pending-deletes, meta KV,
//! share-import ledger.
//!
//! sqlx against SQLite, `INSERT OR REPLACE` for upsert semantics,
//! JSON-encoded sidecar columns for structured fields. WAL journaling
//! is enabled once, at connection time, not per-call.

mod schema;

use crate::error::{Result, SharmeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// A single fact row. `dirty` is local-only and is
/// stripped before transmission by [`crate::shard::fact_to_upsert_op`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub scope: String,
    pub key: String,
    pub value: String,
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source_session: Option<String>,
    pub created: DateTime<Utc>,
    pub last_confirmed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default, skip_serializing)]
    pub dirty: bool,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingDelete {
    pub key: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SharedConversationImport {
    pub share_id: String,
    pub conversation_id: String,
    pub imported_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Opens (creating if needed) the SQLite database at `path`, with
    /// WAL journaling and foreign keys enforced.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query(schema::SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Insert or replace by `key`. Sets `dirty=1`, preserves the
    /// original `created` timestamp if the key already existed,
    /// advances `last_confirmed` monotonically, and clears any
    /// matching pending-delete — all in one transaction.
    pub async fn upsert_fact(&self, fact: &Fact) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        let existing = sqlx::query("SELECT created, last_confirmed FROM facts WHERE key = ?")
            .bind(&fact.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        let (created, last_confirmed) = match existing {
            Some(row) => {
                let created: String = row.get(0);
                let prev_confirmed: String = row.get(1);
                let created = DateTime::parse_from_rfc3339(&created)
                    .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
                    .with_timezone(&Utc);
                let prev_confirmed = DateTime::parse_from_rfc3339(&prev_confirmed)
                    .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
                    .with_timezone(&Utc);
                (created, fact.last_confirmed.max(prev_confirmed))
            }
            None => (fact.created, fact.last_confirmed),
        };

        let tags_json = serde_json::to_string(&fact.tags)
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO facts
               (id, scope, key, value, tags_json, confidence, source_session,
                created, last_confirmed, access_count, dirty)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)"#,
        )
        .bind(&fact.id)
        .bind(&fact.scope)
        .bind(&fact.key)
        .bind(&fact.value)
        .bind(tags_json)
        .bind(fact.confidence)
        .bind(&fact.source_session)
        .bind(created.to_rfc3339())
        .bind(last_confirmed.to_rfc3339())
        .bind(fact.access_count)
        .execute(&mut *tx)
        .await
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query("DELETE FROM pending_deletes WHERE key = ?")
            .bind(&fact.key)
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(())
    }

    /// If `key` is present, removes it and records a pending-delete
    /// tombstone. Idempotent: deleting an already-absent key is a
    /// no-op (the first call's tombstone stands).
    pub async fn delete_fact(&self, key: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        let result = sqlx::query("DELETE FROM facts WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "INSERT OR REPLACE INTO pending_deletes (key, deleted_at) VALUES (?, ?)",
            )
            .bind(key)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(())
    }

    pub async fn get_fact(&self, key: &str) -> Result<Option<Fact>> {
        let row = sqlx::query("SELECT * FROM facts WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        row.map(row_to_fact).transpose()
    }

    /// Ordered by `last_confirmed` desc.
    pub async fn get_all_facts(&self) -> Result<Vec<Fact>> {
        let rows = sqlx::query("SELECT * FROM facts ORDER BY last_confirmed DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        rows.into_iter().map(row_to_fact).collect()
    }

    /// Rows whose scope equals `scope` or `global`.
    pub async fn get_facts_by_scope(&self, scope: &str) -> Result<Vec<Fact>> {
        let rows = sqlx::query(
            "SELECT * FROM facts WHERE scope = ? OR scope = 'global' ORDER BY last_confirmed DESC",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        rows.into_iter().map(row_to_fact).collect()
    }

    pub async fn get_dirty_facts(&self) -> Result<Vec<Fact>> {
        let rows = sqlx::query("SELECT * FROM facts WHERE dirty = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        rows.into_iter().map(row_to_fact).collect()
    }

    pub async fn get_pending_deletes(&self) -> Result<Vec<PendingDelete>> {
        let rows = sqlx::query("SELECT key, deleted_at FROM pending_deletes")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.get(0);
                let deleted_at: String = row.get(1);
                let deleted_at = DateTime::parse_from_rfc3339(&deleted_at)
                    .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
                    .with_timezone(&Utc);
                Ok(PendingDelete { key, deleted_at })
            })
            .collect()
    }

    /// Single transaction: zero all `dirty`, empty pending deletes.
    /// Must never run concurrently with an in-flight upsert — callers
    /// serialize this against upserts through the same connection
    /// pool's transaction isolation.
    pub async fn clear_dirty_state(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query("UPDATE facts SET dirty = 0")
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query("DELETE FROM pending_deletes")
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(())
    }

    /// `clear_dirty_state` plus advancing `current_version` and
    /// `last_pushed_version`, all in one transaction — must stay
    /// atomic with the version-meta update.
    pub async fn finalize_push(&self, last_version: u32) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query("UPDATE facts SET dirty = 0")
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        sqlx::query("DELETE FROM pending_deletes")
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        let version = last_version.to_string();
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(crate::meta::CURRENT_VERSION)
            .bind(&version)
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(crate::meta::LAST_PUSHED_VERSION)
            .bind(&version)
            .execute(&mut *tx)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(())
    }

    pub async fn increment_access_count(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE facts SET access_count = access_count + 1 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(())
    }

    /// Writes a fact reconstructed from replay with `dirty=0` — this
    /// is remote-sourced state, not a pending local mutation, so it
    /// must not re-enter the next push's dirty set.
    pub async fn replay_upsert(&self, fact: &Fact) -> Result<()> {
        let tags_json = serde_json::to_string(&fact.tags)
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO facts
               (id, scope, key, value, tags_json, confidence, source_session,
                created, last_confirmed, access_count, dirty)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)"#,
        )
        .bind(&fact.id)
        .bind(&fact.scope)
        .bind(&fact.key)
        .bind(&fact.value)
        .bind(tags_json)
        .bind(fact.confidence)
        .bind(&fact.source_session)
        .bind(fact.created.to_rfc3339())
        .bind(fact.last_confirmed.to_rfc3339())
        .bind(fact.access_count)
        .execute(&self.pool)
        .await
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        Ok(())
    }

    /// Removes a fact as a replayed `delete` op, without leaving a
    /// pending-delete tombstone (that tombstone is only for mutations
    /// still awaiting their own push).
    pub async fn replay_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM facts WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(())
    }

    pub async fn set_current_version(&self, version: u32) -> Result<()> {
        self.set_meta(crate::meta::CURRENT_VERSION, &version.to_string())
            .await
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(())
    }

    pub async fn has_shared_conversation_import(&self, share_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM shared_conversation_imports WHERE share_id = ?")
            .bind(share_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(row.is_some())
    }

    pub async fn save_shared_conversation_import(
        &self,
        entry: &SharedConversationImport,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO shared_conversation_imports
               (share_id, conversation_id, imported_at) VALUES (?, ?, ?)"#,
        )
        .bind(&entry.share_id)
        .bind(&entry.conversation_id)
        .bind(entry.imported_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;
        Ok(())
    }

    pub async fn get_shared_conversation_imports(&self) -> Result<Vec<SharedConversationImport>> {
        let rows = sqlx::query(
            "SELECT share_id, conversation_id, imported_at FROM shared_conversation_imports",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let imported_at: String = row.get(2);
                let imported_at = DateTime::parse_from_rfc3339(&imported_at)
                    .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
                    .with_timezone(&Utc);
                Ok(SharedConversationImport {
                    share_id: row.get(0),
                    conversation_id: row.get(1),
                    imported_at,
                })
            })
            .collect()
    }
}

fn row_to_fact(row: sqlx::sqlite::SqliteRow) -> Result<Fact> {
    let tags_json: String = row.get("tags_json");
    let tags: Vec<String> =
        serde_json::from_str(&tags_json).map_err(|e| SharmeError::StoreCorruption(e.to_string()))?;

    let created: String = row.get("created");
    let last_confirmed: String = row.get("last_confirmed");

    Ok(Fact {
        id: row.get("id"),
        scope: row.get("scope"),
        key: row.get("key"),
        value: row.get("value"),
        tags,
        confidence: row.get("confidence"),
        source_session: row.get("source_session"),
        created: DateTime::parse_from_rfc3339(&created)
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
            .with_timezone(&Utc),
        last_confirmed: DateTime::parse_from_rfc3339(&last_confirmed)
            .map_err(|e| SharmeError::StoreCorruption(e.to_string()))?
            .with_timezone(&Utc),
        access_count: row.get("access_count"),
        dirty: row.get::<i64, _>("dirty") != 0,
    })
}
