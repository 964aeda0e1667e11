//! Key/value configuration rows with row identity.
//!
//! Rows live in the `config` table. A key is *not* unique: namespaces such as
//! `"repository"` deliberately hold many rows distinguished by id, while
//! singleton namespaces such as `"lang"` are expected to hold at most one.
//! [`ConfigStore::upsert_by_key`] enforces the singleton expectation by
//! refusing to write when it finds the key duplicated — picking one of
//! several rows at random would corrupt whichever subsystem owns the others.
//!
//! The store performs no change tracking itself; notification side effects
//! belong to [`crate::service::ConfigService`].

#![allow(clippy::cast_sign_loss)]

use rusqlite::{params, OptionalExtension};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::db::Db;

/// One persisted configuration row.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRecord {
    /// Row identity, unique across the table.
    pub id: String,
    /// Namespace the row belongs to. Not unique.
    pub key: String,
    /// UTF-8 JSON document. Shape evolution is the owning subsystem's concern.
    pub value: JsonValue,
    /// Creation time, Unix seconds.
    pub created_at: u64,
    /// Last-write time, Unix seconds.
    pub updated_at: u64,
}

/// Errors raised by config row operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A singleton-mode upsert found the key duplicated. No write occurred.
    #[error("key {key:?} has {count} rows, singleton upsert refused")]
    AmbiguousKey {
        /// The duplicated key.
        key: String,
        /// How many rows currently share it.
        count: usize,
    },

    /// A stored value or a value to be stored is not a valid JSON document.
    #[error("value for row {id:?} is not valid JSON: {source}")]
    Codec {
        /// The row whose value failed to encode or decode.
        id: String,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// CRUD surface over the `config` table.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    db: Db,
}

impl ConfigStore {
    /// Creates a store over the shared database handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upserts the single row expected under `key`.
    ///
    /// With zero matching rows a fresh row is inserted and its generated id
    /// returned. With exactly one, that row's value and `updated_at` are
    /// rewritten in place and the id is preserved. With more than one the
    /// operation fails with [`StoreError::AmbiguousKey`] and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns `AmbiguousKey` on a duplicated singleton key, or the
    /// underlying database error.
    pub fn upsert_by_key(&self, key: &str, value: &JsonValue) -> Result<String, StoreError> {
        let text = encode_value("", value)?;
        let conn = self.db.conn();

        let mut stmt = conn.prepare("SELECT id FROM config WHERE key = ?1")?;
        let ids = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        match ids.as_slice() {
            [] => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO config (id, key, value, created_at, updated_at)
                     VALUES (?1, ?2, ?3, strftime('%s', 'now'), strftime('%s', 'now'))",
                    params![id, key, text],
                )?;
                Ok(id)
            }
            [id] => {
                conn.execute(
                    "UPDATE config SET value = ?1, updated_at = strftime('%s', 'now') WHERE id = ?2",
                    params![text, id],
                )?;
                Ok(id.clone())
            }
            many => {
                tracing::warn!(key, count = many.len(), "singleton key duplicated, refusing upsert");
                Err(StoreError::AmbiguousKey {
                    key: key.to_string(),
                    count: many.len(),
                })
            }
        }
    }

    /// Upserts a row addressed by a caller-allocated id.
    ///
    /// Absent ids are inserted as new rows; present ids have their `key` and
    /// value overwritten in place. This is how a single namespace hosts many
    /// co-existing rows.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn upsert_by_id(&self, id: &str, key: &str, value: &JsonValue) -> Result<(), StoreError> {
        let text = encode_value(id, value)?;
        let conn = self.db.conn();

        let exists: Option<String> = conn
            .query_row("SELECT id FROM config WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;

        if exists.is_some() {
            conn.execute(
                "UPDATE config SET key = ?1, value = ?2, updated_at = strftime('%s', 'now') WHERE id = ?3",
                params![key, text, id],
            )?;
        } else {
            conn.execute(
                "INSERT INTO config (id, key, value, created_at, updated_at)
                 VALUES (?1, ?2, ?3, strftime('%s', 'now'), strftime('%s', 'now'))",
                params![id, key, text],
            )?;
        }
        Ok(())
    }

    /// Inserts an unconditional new row and returns its generated id.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn insert(&self, key: &str, value: &JsonValue) -> Result<String, StoreError> {
        let text = encode_value("", value)?;
        let id = Uuid::new_v4().to_string();
        self.db.conn().execute(
            "INSERT INTO config (id, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s', 'now'), strftime('%s', 'now'))",
            params![id, key, text],
        )?;
        Ok(id)
    }

    /// Deletes a row. Absent ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.db
            .conn()
            .execute("DELETE FROM config WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Reads every row under `key`.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error, or `Codec` for a row whose
    /// stored value is not valid JSON.
    pub fn get_by_key(&self, key: &str) -> Result<Vec<ConfigRecord>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, key, value, created_at, updated_at FROM config WHERE key = ?1",
        )?;
        let rows = stmt
            .query_map(params![key], map_raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        rows.into_iter().map(RawRecord::decode).collect()
    }

    /// Reads a single row by id, if present.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error, or `Codec` for a row whose
    /// stored value is not valid JSON.
    pub fn get_by_id(&self, id: &str) -> Result<Option<ConfigRecord>, StoreError> {
        let conn = self.db.conn();
        let raw = conn
            .query_row(
                "SELECT id, key, value, created_at, updated_at FROM config WHERE id = ?1",
                params![id],
                map_raw_row,
            )
            .optional()?;

        raw.map(RawRecord::decode).transpose()
    }
}

/// Row as stored, value still serialized.
struct RawRecord {
    id: String,
    key: String,
    value: String,
    created_at: u64,
    updated_at: u64,
}

impl RawRecord {
    fn decode(self) -> Result<ConfigRecord, StoreError> {
        let value = serde_json::from_str(&self.value).map_err(|source| StoreError::Codec {
            id: self.id.clone(),
            source,
        })?;
        Ok(ConfigRecord {
            id: self.id,
            key: self.key,
            value,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: row.get::<_, i64>(3)? as u64,
        updated_at: row.get::<_, i64>(4)? as u64,
    })
}

fn encode_value(id: &str, value: &JsonValue) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec {
        id: id.to_string(),
        source,
    })
}
