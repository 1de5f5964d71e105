//! Repository implementations for SQLite-backed persistence.
//!
//! Provides the session, schedule, and profile stores that operate on the
//! shared [`Database`] using raw SQL. Every successful write is followed by
//! a [`StoreEvent`] on the database's change feed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use rusqlite::OptionalExtension;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use valet_core::error::ValetError;
use valet_core::events::StoreEvent;
use valet_core::store::{ProfileStore, ScheduleStore, SessionStore};
use valet_core::types::{
    session_title, ChatSession, Message, NewScheduleItem, ScheduleItem, UserProfile,
};

use crate::db::Database;

/// Default number of characters of the first user message kept in a title.
pub const DEFAULT_TITLE_CHARS: usize = 30;

// =============================================================================
// Sessions
// =============================================================================

/// Repository for chat sessions. Messages are stored as a JSON array.
pub struct SqliteSessionStore {
    db: Arc<Database>,
    title_chars: usize,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            title_chars: DEFAULT_TITLE_CHARS,
        }
    }

    /// Override how many characters of the first user message form the title.
    pub fn with_title_chars(mut self, title_chars: usize) -> Self {
        self.title_chars = title_chars;
        self
    }

    fn find(&self, id: Uuid) -> Result<Option<ChatSession>, ValetError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, title, messages, created_at, updated_at
                     FROM chat_sessions WHERE id = ?1",
                )
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            let result = stmt
                .query_row(rusqlite::params![id.to_string()], |row| {
                    Ok(row_to_session(row))
                })
                .optional()
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            result.transpose()
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, messages: &[Message]) -> Result<ChatSession, ValetError> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            title: session_title(messages, self.title_chars, now),
            messages: messages.to_vec(),
            created_at: now,
            updated_at: now,
        };
        let messages_json = serde_json::to_string(&session.messages)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, title, messages, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session.id.to_string(),
                    session.title,
                    messages_json,
                    session.created_at.timestamp_millis(),
                    session.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to save chat session: {}", e)))?;
            Ok(())
        })?;

        debug!(session_id = %session.id, messages = session.messages.len(), "Chat session created");
        self.db.changes().publish(StoreEvent::SessionCreated {
            session_id: session.id,
        });
        Ok(session)
    }

    async fn update(
        &self,
        id: Uuid,
        messages: &[Message],
    ) -> Result<Option<ChatSession>, ValetError> {
        let Some(mut session) = self.find(id)? else {
            return Ok(None);
        };
        session.messages = messages.to_vec();
        session.updated_at = Utc::now();
        let messages_json = serde_json::to_string(&session.messages)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_sessions SET messages = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![
                    id.to_string(),
                    messages_json,
                    session.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to update chat session: {}", e)))?;
            Ok(())
        })?;

        debug!(session_id = %id, messages = session.messages.len(), "Chat session updated");
        self.db
            .changes()
            .publish(StoreEvent::SessionUpdated { session_id: id });
        Ok(Some(session))
    }

    async fn delete(&self, id: Uuid) -> Result<(), ValetError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chat_sessions WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to delete chat session: {}", e)))
        })?;

        if removed > 0 {
            self.db
                .changes()
                .publish(StoreEvent::SessionDeleted { session_id: id });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChatSession>, ValetError> {
        self.find(id)
    }

    async fn list(&self) -> Result<Vec<ChatSession>, ValetError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, title, messages, created_at, updated_at
                     FROM chat_sessions
                     ORDER BY updated_at DESC",
                )
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok(row_to_session(row)))
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            let mut sessions = Vec::new();
            for row in rows {
                let session = row.map_err(|e| ValetError::Storage(e.to_string()))??;
                sessions.push(session);
            }
            Ok(sessions)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.db.changes().subscribe()
    }
}

// =============================================================================
// Schedule
// =============================================================================

/// Repository for schedule items.
pub struct SqliteScheduleStore {
    db: Arc<Database>,
}

impl SqliteScheduleStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn query_items(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ScheduleItem>, ValetError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(params, |row| Ok(row_to_schedule_item(row)))
                .map_err(|e| ValetError::Storage(e.to_string()))?;

            let mut items = Vec::new();
            for row in rows {
                let item = row.map_err(|e| ValetError::Storage(e.to_string()))??;
                items.push(item);
            }
            Ok(items)
        })
    }
}

const SCHEDULE_COLUMNS: &str = "id, title, description, date_time, is_completed, created_at";

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn create(&self, new_item: NewScheduleItem) -> Result<ScheduleItem, ValetError> {
        let item = ScheduleItem {
            id: Uuid::new_v4(),
            title: new_item.title,
            description: new_item.description,
            date_time: new_item.date_time,
            is_completed: false,
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schedule_items (id, title, description, date_time, is_completed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    item.id.to_string(),
                    item.title,
                    item.description,
                    item.date_time.timestamp_millis(),
                    item.is_completed as i32,
                    item.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to save schedule item: {}", e)))?;
            Ok(())
        })?;

        debug!(item_id = %item.id, title = %item.title, "Schedule item created");
        self.db
            .changes()
            .publish(StoreEvent::ScheduleItemCreated { item_id: item.id });
        Ok(item)
    }

    async fn update(&self, item: &ScheduleItem) -> Result<(), ValetError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE schedule_items
                 SET title = ?2, description = ?3, date_time = ?4, is_completed = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    item.id.to_string(),
                    item.title,
                    item.description,
                    item.date_time.timestamp_millis(),
                    item.is_completed as i32,
                ],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to update schedule item: {}", e)))
        })?;

        if changed == 0 {
            return Err(ValetError::NotFound(format!("schedule item {}", item.id)));
        }
        self.db
            .changes()
            .publish(StoreEvent::ScheduleItemUpdated { item_id: item.id });
        Ok(())
    }

    async fn set_completed(&self, id: Uuid, completed: bool) -> Result<(), ValetError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE schedule_items SET is_completed = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), completed as i32],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to update schedule item: {}", e)))
        })?;

        if changed == 0 {
            return Err(ValetError::NotFound(format!("schedule item {}", id)));
        }
        self.db
            .changes()
            .publish(StoreEvent::ScheduleItemUpdated { item_id: id });
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ValetError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM schedule_items WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to delete schedule item: {}", e)))
        })?;

        if removed > 0 {
            self.db
                .changes()
                .publish(StoreEvent::ScheduleItemDeleted { item_id: id });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduleItem>, ValetError> {
        let sql = format!("SELECT {} FROM schedule_items WHERE id = ?1", SCHEDULE_COLUMNS);
        let id = id.to_string();
        Ok(self.query_items(&sql, &[&id])?.into_iter().next())
    }

    async fn list(&self) -> Result<Vec<ScheduleItem>, ValetError> {
        let sql = format!(
            "SELECT {} FROM schedule_items ORDER BY date_time ASC",
            SCHEDULE_COLUMNS
        );
        self.query_items(&sql, &[])
    }

    async fn upcoming(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleItem>, ValetError> {
        let sql = format!(
            "SELECT {} FROM schedule_items
             WHERE is_completed = 0 AND date_time >= ?1
             ORDER BY date_time ASC
             LIMIT ?2",
            SCHEDULE_COLUMNS
        );
        let now_ms = now.timestamp_millis();
        let limit = limit as i64;
        self.query_items(&sql, &[&now_ms, &limit])
    }

    async fn for_date(&self, day: NaiveDate) -> Result<Vec<ScheduleItem>, ValetError> {
        let start = local_midnight(day)?;
        let end = local_midnight(day + Duration::days(1))?;
        let sql = format!(
            "SELECT {} FROM schedule_items
             WHERE date_time >= ?1 AND date_time < ?2
             ORDER BY date_time ASC",
            SCHEDULE_COLUMNS
        );
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        self.query_items(&sql, &[&start_ms, &end_ms])
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.db.changes().subscribe()
    }
}

/// Start of a local calendar day as a UTC instant.
fn local_midnight(day: NaiveDate) -> Result<DateTime<Utc>, ValetError> {
    let naive = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ValetError::Storage(format!("Invalid day: {}", day)))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ValetError::Storage(format!("No local midnight on {}", day)))?;
    Ok(local.with_timezone(&Utc))
}

// =============================================================================
// Profile
// =============================================================================

/// Repository for the singleton user profile (row id 1).
pub struct SqliteProfileStore {
    db: Arc<Database>,
}

impl SqliteProfileStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn find(&self) -> Result<Option<UserProfile>, ValetError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    "SELECT name, birthday, occupation, hobbies, preferences, last_updated
                     FROM user_profile WHERE id = 1",
                    [],
                    |row| Ok(row_to_profile(row)),
                )
                .optional()
                .map_err(|e| ValetError::Storage(e.to_string()))?;
            result.transpose()
        })
    }

    fn insert_default(&self) -> Result<bool, ValetError> {
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO user_profile (id, last_updated) VALUES (1, ?1)",
                rusqlite::params![Utc::now().timestamp_millis()],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to create profile: {}", e)))
        })?;

        if inserted > 0 {
            debug!("Default user profile created");
            self.db.changes().publish(StoreEvent::ProfileUpdated);
        }
        Ok(inserted > 0)
    }
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn get(&self) -> Result<UserProfile, ValetError> {
        if let Some(profile) = self.find()? {
            return Ok(profile);
        }
        self.insert_default()?;
        self.find()?
            .ok_or_else(|| ValetError::NotFound("user profile".to_string()))
    }

    async fn create_if_absent(&self) -> Result<bool, ValetError> {
        self.insert_default()
    }

    async fn update_basic(
        &self,
        name: &str,
        birthday: &str,
        occupation: &str,
        hobbies: &str,
    ) -> Result<UserProfile, ValetError> {
        self.insert_default()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE user_profile
                 SET name = ?1, birthday = ?2, occupation = ?3, hobbies = ?4, last_updated = ?5
                 WHERE id = 1",
                rusqlite::params![
                    name,
                    birthday,
                    occupation,
                    hobbies,
                    Utc::now().timestamp_millis()
                ],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to update profile: {}", e)))?;
            Ok(())
        })?;

        self.db.changes().publish(StoreEvent::ProfileUpdated);
        self.find()?
            .ok_or_else(|| ValetError::NotFound("user profile".to_string()))
    }

    async fn set_preferences(&self, preferences_json: &str) -> Result<(), ValetError> {
        self.insert_default()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE user_profile SET preferences = ?1, last_updated = ?2 WHERE id = 1",
                rusqlite::params![preferences_json, Utc::now().timestamp_millis()],
            )
            .map_err(|e| ValetError::Storage(format!("Failed to update preferences: {}", e)))?;
            Ok(())
        })?;

        self.db.changes().publish(StoreEvent::ProfileUpdated);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.db.changes().subscribe()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_id(raw: &str) -> Result<Uuid, ValetError> {
    Uuid::parse_str(raw).map_err(|e| ValetError::Storage(format!("Invalid UUID: {}", e)))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSession, ValetError> {
    let id_str: String = row.get(0).map_err(|e| ValetError::Storage(e.to_string()))?;
    let title: String = row.get(1).map_err(|e| ValetError::Storage(e.to_string()))?;
    let messages_json: String = row.get(2).map_err(|e| ValetError::Storage(e.to_string()))?;
    let created_at: i64 = row.get(3).map_err(|e| ValetError::Storage(e.to_string()))?;
    let updated_at: i64 = row.get(4).map_err(|e| ValetError::Storage(e.to_string()))?;

    Ok(ChatSession {
        id: parse_id(&id_str)?,
        title,
        messages: serde_json::from_str(&messages_json)?,
        created_at: millis_to_utc(created_at),
        updated_at: millis_to_utc(updated_at),
    })
}

fn row_to_schedule_item(row: &rusqlite::Row<'_>) -> Result<ScheduleItem, ValetError> {
    let id_str: String = row.get(0).map_err(|e| ValetError::Storage(e.to_string()))?;
    let title: String = row.get(1).map_err(|e| ValetError::Storage(e.to_string()))?;
    let description: String = row.get(2).map_err(|e| ValetError::Storage(e.to_string()))?;
    let date_time: i64 = row.get(3).map_err(|e| ValetError::Storage(e.to_string()))?;
    let is_completed: i32 = row.get(4).map_err(|e| ValetError::Storage(e.to_string()))?;
    let created_at: i64 = row.get(5).map_err(|e| ValetError::Storage(e.to_string()))?;

    Ok(ScheduleItem {
        id: parse_id(&id_str)?,
        title,
        description,
        date_time: millis_to_utc(date_time),
        is_completed: is_completed != 0,
        created_at: millis_to_utc(created_at),
    })
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> Result<UserProfile, ValetError> {
    let last_updated: i64 = row.get(5).map_err(|e| ValetError::Storage(e.to_string()))?;
    Ok(UserProfile {
        name: row.get(0).map_err(|e| ValetError::Storage(e.to_string()))?,
        birthday: row.get(1).map_err(|e| ValetError::Storage(e.to_string()))?,
        occupation: row.get(2).map_err(|e| ValetError::Storage(e.to_string()))?,
        hobbies: row.get(3).map_err(|e| ValetError::Storage(e.to_string()))?,
        preferences: row.get(4).map_err(|e| ValetError::Storage(e.to_string()))?,
        last_updated: millis_to_utc(last_updated),
    })
}
