//! Observable state owned by the orchestrator.

use uuid::Uuid;

use valet_core::types::{ChatSession, Message, ScheduleItem, UserProfile};

/// The active conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub input_enabled: bool,
    pub error: Option<String>,
    /// `None` until the conversation has been saved once.
    pub current_session_id: Option<Uuid>,
    /// Bumped on every wholesale reset so stale replies can be recognised.
    pub generation: u64,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            is_loading: false,
            input_enabled: true,
            error: None,
            current_session_id: None,
            generation: 0,
        }
    }
}

impl ConversationState {
    /// A fresh, idle conversation one generation after `self`.
    pub fn reset(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileState {
    pub profile: UserProfile,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleState {
    pub items: Vec<ScheduleItem>,
    pub error: Option<String>,
}

/// Saved sessions, most recently updated first.
pub type HistoryState = Vec<ChatSession>;

/// What a successful `submit` did.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Handled locally as a schedule command.
    Scheduled(ScheduleItem),
    /// The completion service replied.
    Replied(Message),
    /// The exchange failed; the message is also in the conversation error.
    Failed(String),
    /// The conversation was reset while the request was in flight.
    Discarded,
}
