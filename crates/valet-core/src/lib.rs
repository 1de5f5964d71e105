//! Shared domain types, configuration, errors, and store contracts for Valet.

pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod types;

pub use config::ValetConfig;
pub use error::{Result, ValetError};
pub use events::{StoreEvent, StoreTopic};
pub use store::{ChangeFeed, CredentialStore, ProfileStore, ScheduleStore, SessionStore};
pub use types::*;
