//! Valet storage crate - SQLite persistence and credential storage.
//!
//! Provides a WAL-mode SQLite database with migrations, repository
//! implementations of the session, schedule, and profile stores, and API
//! key storage in the OS keyring with a file fallback.

pub mod credentials;
pub mod db;
pub mod migrations;
pub mod repository;

pub use credentials::{open_credential_store, FileCredentialStore, KeyringCredentialStore};
pub use db::Database;
pub use repository::{SqliteProfileStore, SqliteScheduleStore, SqliteSessionStore};
