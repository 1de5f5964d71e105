use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Conversation
// =============================================================================

/// A single chat message. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub is_user_message: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A message typed by the user, stamped now.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            is_user_message: true,
            timestamp: Utc::now(),
        }
    }

    /// A message produced by the assistant, stamped now.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            is_user_message: false,
            timestamp: Utc::now(),
        }
    }

    /// Wire role used by the completion service.
    pub fn role(&self) -> &'static str {
        if self.is_user_message {
            "user"
        } else {
            "assistant"
        }
    }
}

/// A persisted, titled, linear conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derive a session title from its messages.
///
/// Uses the first user message, truncated to `max_chars` characters with a
/// trailing `...` when longer. Without any user message the title is
/// `New Chat <timestamp>`.
pub fn session_title(messages: &[Message], max_chars: usize, now: DateTime<Utc>) -> String {
    match messages.iter().find(|m| m.is_user_message) {
        Some(first) => {
            if first.content.chars().count() > max_chars {
                let head: String = first.content.chars().take(max_chars).collect();
                format!("{}...", head)
            } else {
                first.content.clone()
            }
        }
        None => format!("New Chat {}", now.format("%a %b %-d %H:%M:%S %Y")),
    }
}

// =============================================================================
// Schedule
// =============================================================================

/// A titled, timestamped, completable reminder or task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub date_time: DateTime<Utc>,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduleItem {
    /// Not completed and not yet due.
    pub fn is_upcoming(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed && self.date_time >= now
    }
}

/// Fields supplied when creating a schedule item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewScheduleItem {
    pub title: String,
    pub description: String,
    pub date_time: DateTime<Utc>,
}

// =============================================================================
// Profile
// =============================================================================

/// The singleton user profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub birthday: String,
    pub occupation: String,
    pub hobbies: String,
    /// JSON object text holding string preferences.
    pub preferences: String,
    pub last_updated: DateTime<Utc>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            birthday: String::new(),
            occupation: String::new(),
            hobbies: String::new(),
            preferences: String::new(),
            last_updated: Utc::now(),
        }
    }
}

impl UserProfile {
    /// Parsed preferences. Empty or malformed JSON yields an empty map.
    pub fn preference_map(&self) -> BTreeMap<String, String> {
        if self.preferences.trim().is_empty() {
            return BTreeMap::new();
        }
        serde_json::from_str(&self.preferences).unwrap_or_default()
    }

    /// Look up one preference.
    pub fn preference(&self, key: &str) -> Option<String> {
        self.preference_map().remove(key)
    }

    /// Preferences JSON with `key` set to `value`.
    pub fn preferences_with(&self, key: &str, value: &str) -> crate::Result<String> {
        let mut map = self.preference_map();
        map.insert(key.to_string(), value.to_string());
        Ok(serde_json::to_string(&map)?)
    }
}
