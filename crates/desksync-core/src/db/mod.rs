//! `SQLite`-backed persistence adapter.
//!
//! One database file is shared by every window process of the application.
//! WAL mode keeps concurrent readers cheap while a writer is active, and the
//! embedded schema batch is idempotent so whichever process starts first
//! creates the tables and the rest re-run the batch as a no-op.

// SQLite returns i64 for counts and timestamps; both are non-negative here.
// Mutex poisoning indicates a panic in another task, which is unrecoverable.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors raised while opening or initializing the database.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handle to the application database.
///
/// Cloning is cheap; all clones refer to the same connection. The connection
/// is guarded by a mutex because `SQLITE_OPEN_NO_MUTEX` disables `SQLite`'s
/// internal locking; every query is short, so the guard is never held across
/// an await point.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Db {
    /// Opens or creates the database at the specified path.
    ///
    /// The schema batch (tables, indexes, pragmas) runs on every open.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), DbError> {
        // The batch includes PRAGMA statements; rows they return are ignored.
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Path of the backing file, absent for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection for a batch of statements.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Verifies that WAL mode is enabled.
    ///
    /// In-memory databases report `memory` and fail this check; they are
    /// single-process by construction so nothing is lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal mode cannot be queried.
    pub fn verify_wal_mode(&self) -> Result<bool, DbError> {
        let conn = self.conn();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("path", &self.path).finish()
    }
}
