//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization, and owns
//! the change feed every repository built on this database publishes to.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use valet_core::error::ValetError;
use valet_core::store::ChangeFeed;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Constructed once by the composition root and shared by `Arc` with the
/// repositories; there is no process-wide instance.
pub struct Database {
    conn: Mutex<Connection>,
    changes: ChangeFeed,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, and runs
    /// all pending migrations.
    pub fn new(path: &Path) -> Result<Self, ValetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ValetError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| ValetError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, ValetError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ValetError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| ValetError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, ValetError> {
        let db = Self {
            conn: Mutex::new(conn),
            changes: ChangeFeed::new(),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ValetError>
    where
        F: FnOnce(&Connection) -> Result<T, ValetError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ValetError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Change feed shared by every repository on this database.
    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
