//! Persistence contracts consumed by the conversation engine.
//!
//! Every store is read-your-writes within a process and publishes a
//! [`StoreEvent`] on its [`ChangeFeed`] after each successful write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::events::StoreEvent;
use crate::types::{ChatSession, Message, NewScheduleItem, ScheduleItem, UserProfile};

/// Capacity of the change-notification channel.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Broadcast channel shared by the stores of one database.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Chat session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session built from `messages`; the title is derived.
    async fn create(&self, messages: &[Message]) -> Result<ChatSession>;

    /// Replace the messages of an existing session. `None` if it is gone.
    async fn update(&self, id: Uuid, messages: &[Message]) -> Result<Option<ChatSession>>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ChatSession>>;

    /// All sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<ChatSession>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Schedule item persistence.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, item: NewScheduleItem) -> Result<ScheduleItem>;

    /// Overwrite title, description, date and completion of an existing item.
    async fn update(&self, item: &ScheduleItem) -> Result<()>;

    async fn set_completed(&self, id: Uuid, completed: bool) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleItem>>;

    /// All items, earliest first.
    async fn list(&self) -> Result<Vec<ScheduleItem>>;

    /// Incomplete items due at or after `now`, earliest first.
    async fn upcoming(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleItem>>;

    /// Items falling on the given local calendar day, earliest first.
    async fn for_date(&self, day: NaiveDate) -> Result<Vec<ScheduleItem>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Singleton profile persistence.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The profile, created with defaults if absent.
    async fn get(&self) -> Result<UserProfile>;

    /// Insert the default profile when none exists. Returns whether it inserted.
    async fn create_if_absent(&self) -> Result<bool>;

    async fn update_basic(
        &self,
        name: &str,
        birthday: &str,
        occupation: &str,
        hobbies: &str,
    ) -> Result<UserProfile>;

    /// Replace the preferences JSON text.
    async fn set_preferences(&self, preferences_json: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Opaque storage for the completion-service API key.
pub trait CredentialStore: Send + Sync {
    /// The stored key, or an empty string when none is set.
    fn get(&self) -> Result<String>;

    fn set(&self, key: &str) -> Result<()>;

    /// Whether a non-blank key is stored.
    fn has(&self) -> Result<bool> {
        Ok(!self.get()?.trim().is_empty())
    }

    fn clear(&self) -> Result<()>;
}
