//! Append-only change ledger.
//!
//! Every notified mutation of the config table leaves one `(key, cfgid,
//! ctime)` row behind. Peer processes never re-read the whole store to learn
//! what changed: they remember the timestamp of the last entry they have
//! processed (their watermark) and ask for everything after it.
//!
//! The ledger is deliberately *not* written in the same transaction as the
//! config row. A crash between the two loses at most a notification, and a
//! lost notification is recovered at next process start because the boot
//! sequence reloads projections in full and seeds the watermark from the
//! newest entry.

// Timestamps are Unix seconds well inside i64 range; SQLite stores INTEGER.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::db::Db;

/// One entry in the change log. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Namespace that changed.
    pub key: String,
    /// Row the change touched, when known. Removals keep the removed id.
    pub cfgid: Option<String>,
    /// When the change was recorded, Unix seconds.
    pub ctime: u64,
}

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Reader/writer over the `change` table.
#[derive(Clone, Debug)]
pub struct ChangeLedger {
    db: Db,
}

impl ChangeLedger {
    /// Creates a ledger over the shared database handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn append(&self, key: &str, cfgid: Option<&str>, now: u64) -> Result<(), LedgerError> {
        self.db.conn().execute(
            "INSERT INTO change (key, cfgid, ctime) VALUES (?1, ?2, ?3)",
            params![key, cfgid, now as i64],
        )?;
        Ok(())
    }

    /// Reads every entry strictly newer than `watermark`, ascending by time.
    ///
    /// Returns the empty sequence when the watermark is at or past the newest
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn since(&self, watermark: u64) -> Result<Vec<ChangeEntry>, LedgerError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT key, cfgid, ctime FROM change WHERE ctime > ?1 ORDER BY ctime ASC",
        )?;
        let entries = stmt
            .query_map(params![watermark as i64], |row| {
                Ok(ChangeEntry {
                    key: row.get(0)?,
                    cfgid: row.get(1)?,
                    ctime: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Timestamp of the newest entry, if any.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn latest(&self) -> Result<Option<u64>, LedgerError> {
        let latest: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT ctime FROM change ORDER BY ctime DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(latest.map(|t| t as u64))
    }

    /// Deletes entries older than `older_than` and returns how many went.
    ///
    /// Runs at service initialization only, never mid-poll: a reader in the
    /// middle of [`Self::since`] must not race deletion of entries it has not
    /// consumed. The retention window (default one hour) dwarfs cross-process
    /// notification latency by orders of magnitude; a reader stalled longer
    /// than that converges through its next boot-time full reload.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub fn prune(&self, older_than: u64) -> Result<usize, LedgerError> {
        let removed = self
            .db
            .conn()
            .execute("DELETE FROM change WHERE ctime < ?1", params![older_than as i64])?;
        Ok(removed)
    }
}

/// Distinct keys of a batch, in first-seen order.
///
/// Subscribers react once per key no matter how many rows under that key
/// changed in the batch.
#[must_use]
pub fn distinct_keys(entries: &[ChangeEntry]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for entry in entries {
        if seen.insert(entry.key.as_str()) {
            keys.push(entry.key.clone());
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ChangeLedger {
        ChangeLedger::new(Db::in_memory().unwrap())
    }

    #[test]
    fn since_is_ascending_and_strict() {
        let ledger = ledger();
        ledger.append("a", None, 10).unwrap();
        ledger.append("b", Some("row-b"), 20).unwrap();

        let entries = ledger.since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[0].ctime, 10);
        assert_eq!(entries[1].key, "b");
        assert_eq!(entries[1].cfgid.as_deref(), Some("row-b"));

        // Watermark at an entry excludes that entry.
        let entries = ledger.since(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "b");

        // Watermark at or past the newest entry yields nothing.
        assert!(ledger.since(20).unwrap().is_empty());
        assert!(ledger.since(99).unwrap().is_empty());
    }

    #[test]
    fn distinct_keys_dedupes_in_first_seen_order() {
        let ledger = ledger();
        ledger.append("a", None, 10).unwrap();
        ledger.append("a", None, 15).unwrap();
        ledger.append("b", None, 20).unwrap();
        ledger.append("a", None, 25).unwrap();

        let entries = ledger.since(0).unwrap();
        assert_eq!(distinct_keys(&entries), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn latest_tracks_newest_entry() {
        let ledger = ledger();
        assert_eq!(ledger.latest().unwrap(), None);
        ledger.append("a", None, 10).unwrap();
        ledger.append("b", None, 30).unwrap();
        assert_eq!(ledger.latest().unwrap(), Some(30));
    }

    #[test]
    fn prune_removes_only_older_entries() {
        let ledger = ledger();
        ledger.append("old", None, 100).unwrap();
        ledger.append("kept", None, 200).unwrap();

        let removed = ledger.prune(150).unwrap();
        assert_eq!(removed, 1);

        let entries = ledger.since(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "kept");
    }
}
