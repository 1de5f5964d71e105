//! Conversation engine for Valet.
//!
//! Turns user utterances into either locally handled schedule commands or
//! completion-service exchanges, and keeps the conversation, profile,
//! schedule, and history views in sync with the stores.

pub mod calendar;
pub mod command;
pub mod completion;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod state;

pub use calendar::{CalendarSink, DisabledCalendar, IcsCalendar};
pub use command::ScheduleCommand;
pub use completion::{CompletionClient, CompletionService, HttpTransport, ReqwestTransport};
pub use error::{ChatError, CompletionError};
pub use orchestrator::{Collaborators, Orchestrator, SyncHandle};
pub use state::{ConversationState, HistoryState, ProfileState, ScheduleState, SubmitOutcome};
