//! Database schema migrations.
//!
//! Applies the initial schema: chat_sessions, schedule_items, user_profile,
//! and the schema_migrations bookkeeping table. Instants are stored as
//! Unix milliseconds.

use rusqlite::Connection;
use tracing::info;

use valet_core::error::ValetError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ValetError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ValetError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ValetError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), ValetError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id          TEXT PRIMARY KEY NOT NULL,
            title       TEXT NOT NULL,
            messages    TEXT NOT NULL DEFAULT '[]',
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_sessions_updated
            ON chat_sessions (updated_at DESC);

        CREATE TABLE IF NOT EXISTS schedule_items (
            id           TEXT PRIMARY KEY NOT NULL,
            title        TEXT NOT NULL,
            description  TEXT NOT NULL DEFAULT '',
            date_time    INTEGER NOT NULL,
            is_completed INTEGER NOT NULL DEFAULT 0
                         CHECK (is_completed IN (0, 1)),
            created_at   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schedule_items_date
            ON schedule_items (date_time ASC);

        CREATE INDEX IF NOT EXISTS idx_schedule_items_upcoming
            ON schedule_items (is_completed, date_time ASC);

        -- Exactly one profile row per installation.
        CREATE TABLE IF NOT EXISTS user_profile (
            id           INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
            name         TEXT NOT NULL DEFAULT '',
            birthday     TEXT NOT NULL DEFAULT '',
            occupation   TEXT NOT NULL DEFAULT '',
            hobbies      TEXT NOT NULL DEFAULT '',
            preferences  TEXT NOT NULL DEFAULT '',
            last_updated INTEGER NOT NULL
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| ValetError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}
