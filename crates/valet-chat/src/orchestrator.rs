//! Conversation orchestrator: central coordinator wiring command extraction,
//! context building, the completion service, and the stores.
//!
//! Each submitted utterance is either handled locally as a schedule command
//! or sent to the completion service with a profile/schedule context. All
//! observable state lives in `watch` channels; every change is published as
//! a single new value.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use valet_core::config::ChatConfig;
use valet_core::error::ValetError;
use valet_core::events::StoreTopic;
use valet_core::store::{CredentialStore, ProfileStore, ScheduleStore, SessionStore};
use valet_core::types::{NewScheduleItem, ScheduleItem, UserProfile};

use crate::calendar::CalendarSink;
use crate::command::{self, ScheduleCommand};
use crate::completion::CompletionService;
use crate::context::{build_context, format_date_time};
use crate::error::ChatError;
use crate::state::{ConversationState, HistoryState, ProfileState, ScheduleState, SubmitOutcome};

/// Calendar events mirrored from schedule items last this long.
const EVENT_DURATION_HOURS: i64 = 1;

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub completion: Arc<dyn CompletionService>,
    pub calendar: Arc<dyn CalendarSink>,
}

/// Central chat orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Arc<dyn SessionStore>,
    schedule: Arc<dyn ScheduleStore>,
    profiles: Arc<dyn ProfileStore>,
    credentials: Arc<dyn CredentialStore>,
    completion: Arc<dyn CompletionService>,
    calendar: Arc<dyn CalendarSink>,
    config: ChatConfig,
    api_key_override: StdMutex<Option<String>>,
    conversation: watch::Sender<ConversationState>,
    profile: watch::Sender<ProfileState>,
    schedule_state: watch::Sender<ScheduleState>,
    history: watch::Sender<HistoryState>,
    /// Held for the duration of one submit.
    submit_slot: Mutex<()>,
    /// Serializes session saves so one conversation maps to one session.
    persist_lock: Mutex<()>,
}

/// Keeps the profile, schedule and history views in sync with the stores.
///
/// Stops when [`SyncHandle::stop`] is called or the handle is dropped.
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Orchestrator {
    /// Create an orchestrator over the given collaborators.
    pub fn new(collaborators: Collaborators, config: ChatConfig) -> Self {
        let Collaborators {
            sessions,
            schedule,
            profiles,
            credentials,
            completion,
            calendar,
        } = collaborators;

        Self {
            inner: Arc::new(Inner {
                sessions,
                schedule,
                profiles,
                credentials,
                completion,
                calendar,
                config,
                api_key_override: StdMutex::new(None),
                conversation: watch::Sender::new(ConversationState::default()),
                profile: watch::Sender::new(ProfileState::default()),
                schedule_state: watch::Sender::new(ScheduleState::default()),
                history: watch::Sender::new(HistoryState::default()),
                submit_slot: Mutex::new(()),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Use `key` instead of the credential store for completion requests.
    pub fn set_api_key_override(&self, key: Option<String>) {
        if let Ok(mut guard) = self.inner.api_key_override.lock() {
            *guard = key.filter(|k| !k.trim().is_empty());
        }
    }

    // -----------------------------------------------------------------
    // Observable state
    // -----------------------------------------------------------------

    pub fn conversation(&self) -> watch::Receiver<ConversationState> {
        self.inner.conversation.subscribe()
    }

    pub fn profile(&self) -> watch::Receiver<ProfileState> {
        self.inner.profile.subscribe()
    }

    pub fn schedule(&self) -> watch::Receiver<ScheduleState> {
        self.inner.schedule_state.subscribe()
    }

    pub fn history(&self) -> watch::Receiver<HistoryState> {
        self.inner.history.subscribe()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Create the profile if it is missing and load every view once.
    pub async fn initialize(&self) {
        match self.inner.profiles.create_if_absent().await {
            Ok(true) => info!("Created default user profile"),
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Failed to create user profile");
                self.inner.profile.send_modify(|s| s.error = Some(e.to_string()));
            }
        }
        self.inner.refresh_profile().await;
        self.inner.refresh_schedule().await;
        self.inner.refresh_history().await;
    }

    /// Refresh the views whenever a store reports a change.
    pub fn start_sync(&self) -> SyncHandle {
        let inner = Arc::clone(&self.inner);
        let mut sessions_rx = inner.sessions.subscribe();
        let mut schedule_rx = inner.schedule.subscribe();
        let mut profile_rx = inner.profiles.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let (topic, received) = tokio::select! {
                    ev = sessions_rx.recv() => (StoreTopic::Sessions, ev),
                    ev = schedule_rx.recv() => (StoreTopic::Schedule, ev),
                    ev = profile_rx.recv() => (StoreTopic::Profile, ev),
                };
                match received {
                    // Stores sharing one feed deliver every event to every receiver.
                    Ok(event) if event.topic() != topic => continue,
                    Ok(_) => inner.refresh(topic).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(?topic, skipped, "Change feed lagged; refreshing");
                        inner.refresh(topic).await;
                    }
                    Err(RecvError::Closed) => {
                        debug!(?topic, "Change feed closed; sync stopped");
                        break;
                    }
                }
            }
        });

        SyncHandle { task }
    }

    // -----------------------------------------------------------------
    // Submitting messages
    // -----------------------------------------------------------------

    /// Handle one user utterance.
    ///
    /// Schedule commands are answered locally; everything else goes to the
    /// completion service. Failures of the exchange itself are reported as
    /// [`SubmitOutcome::Failed`] and recorded in the conversation error.
    pub async fn submit(&self, text: &str) -> Result<SubmitOutcome, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let max = self.inner.config.max_message_length;
        if text.chars().count() > max {
            return Err(ChatError::MessageTooLong(max));
        }

        let _slot = self
            .inner
            .submit_slot
            .try_lock()
            .map_err(|_| ChatError::Busy)?;

        match command::extract(text) {
            Some(cmd) => Ok(self.run_local(text, cmd).await),
            None => Ok(self.run_remote(text).await),
        }
    }

    async fn run_local(&self, text: &str, cmd: ScheduleCommand) -> SubmitOutcome {
        let inner = &self.inner;
        let generation = inner.generation();
        debug!(title = %cmd.title, "Handling schedule command locally");

        let new_item = NewScheduleItem {
            title: cmd.title,
            description: cmd.description,
            date_time: cmd.date_time,
        };
        let item = match inner.schedule.create(new_item).await {
            Ok(item) => item,
            Err(e) => {
                error!(error = %e, "Failed to save schedule item");
                let message = e.to_string();
                inner
                    .schedule_state
                    .send_modify(|s| s.error = Some(message.clone()));
                inner
                    .conversation
                    .send_modify(|s| s.error = Some(message.clone()));
                return SubmitOutcome::Failed(message);
            }
        };

        inner.mirror_to_calendar(&item).await;
        inner.refresh_schedule().await;

        let confirmation = format!(
            "I've added \"{}\" to your schedule for {}.",
            item.title,
            format_date_time(item.date_time)
        );
        let appended = inner.conversation.send_if_modified(|s| {
            if s.generation != generation {
                return false;
            }
            s.messages.push(valet_core::Message::user(text));
            s.messages.push(valet_core::Message::assistant(confirmation));
            s.error = None;
            true
        });

        if appended {
            inner.persist_after_exchange(generation).await;
        } else {
            info!(item_id = %item.id, "Conversation reset during schedule command; confirmation dropped");
        }
        SubmitOutcome::Scheduled(item)
    }

    async fn run_remote(&self, text: &str) -> SubmitOutcome {
        let inner = &self.inner;

        let mut history = Vec::new();
        let mut generation = 0;
        inner.conversation.send_modify(|s| {
            history = s.messages.clone();
            generation = s.generation;
            s.messages.push(valet_core::Message::user(text));
            s.is_loading = true;
            s.input_enabled = false;
            s.error = None;
        });

        let context = inner.system_context().await;
        let api_key = inner.api_key();
        debug!(history = history.len(), generation, "Requesting completion");
        let result = inner
            .completion
            .complete(&api_key, &history, text, Some(&context))
            .await;

        match result {
            Ok(reply) => {
                let applied = inner.conversation.send_if_modified(|s| {
                    if s.generation != generation {
                        return false;
                    }
                    s.messages.push(reply.clone());
                    s.is_loading = false;
                    s.input_enabled = true;
                    s.error = None;
                    true
                });
                if !applied {
                    info!(generation, "Conversation reset while waiting; reply discarded");
                    return SubmitOutcome::Discarded;
                }
                inner.persist_after_exchange(generation).await;
                SubmitOutcome::Replied(reply)
            }
            Err(e) => {
                let message = e.to_string();
                let applied = inner.conversation.send_if_modified(|s| {
                    if s.generation != generation {
                        return false;
                    }
                    s.is_loading = false;
                    s.input_enabled = true;
                    s.error = Some(message.clone());
                    true
                });
                if !applied {
                    info!(generation, "Conversation reset while waiting; failure discarded");
                    return SubmitOutcome::Discarded;
                }
                warn!(error = %e, "Completion request failed");
                SubmitOutcome::Failed(message)
            }
        }
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    /// Start an empty conversation. The previous one is not saved.
    pub fn create_new_chat(&self) {
        self.inner.conversation.send_modify(|s| *s = s.reset());
        debug!("Started a new chat");
    }

    /// Replace the conversation with a saved session.
    pub async fn load_chat_session(&self, id: Uuid) -> Result<(), ChatError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .await?
            .ok_or(ChatError::SessionNotFound(id))?;

        self.inner.conversation.send_modify(|s| {
            let mut next = s.reset();
            next.messages = session.messages;
            next.current_session_id = Some(session.id);
            *s = next;
        });
        info!(session_id = %id, "Loaded chat session");
        Ok(())
    }

    /// Delete a saved session; deleting the active one starts a new chat.
    pub async fn delete_chat_session(&self, id: Uuid) -> Result<(), ChatError> {
        self.inner.sessions.delete(id).await?;

        let is_current = self.inner.conversation.borrow().current_session_id == Some(id);
        if is_current {
            self.create_new_chat();
        }
        self.inner.refresh_history().await;
        info!(session_id = %id, "Deleted chat session");
        Ok(())
    }

    /// Save the conversation now: create a session or update the active one.
    pub async fn save_current_chat(&self) -> Result<(), ChatError> {
        let generation = self.inner.generation();
        self.inner.persist_session(generation).await?;
        Ok(())
    }

    pub fn clear_error(&self) {
        self.inner.conversation.send_if_modified(|s| s.error.take().is_some());
    }

    // -----------------------------------------------------------------
    // Profile
    // -----------------------------------------------------------------

    pub async fn update_profile(
        &self,
        name: &str,
        birthday: &str,
        occupation: &str,
        hobbies: &str,
    ) -> Result<UserProfile, ChatError> {
        match self
            .inner
            .profiles
            .update_basic(name, birthday, occupation, hobbies)
            .await
        {
            Ok(profile) => {
                self.inner.profile.send_modify(|s| {
                    s.profile = profile.clone();
                    s.error = None;
                });
                Ok(profile)
            }
            Err(e) => Err(self.inner.record_profile_error(e)),
        }
    }

    /// Store one key in the profile's preference map.
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let result = async {
            let profile = self.inner.profiles.get().await?;
            let json = profile.preferences_with(key, value)?;
            self.inner.profiles.set_preferences(&json).await?;
            Ok::<_, ValetError>(json)
        }
        .await;

        match result {
            Ok(json) => {
                self.inner.profile.send_modify(|s| {
                    s.profile.preferences = json;
                    s.error = None;
                });
                Ok(())
            }
            Err(e) => Err(self.inner.record_profile_error(e)),
        }
    }

    /// A preference from the loaded profile, or `default` when unset.
    pub fn get_preference(&self, key: &str, default: &str) -> String {
        self.inner
            .profile
            .borrow()
            .profile
            .preference(key)
            .unwrap_or_else(|| default.to_string())
    }

    // -----------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------

    /// Add an item directly, mirroring it to the calendar when permitted.
    pub async fn add_schedule_item(
        &self,
        title: &str,
        description: &str,
        date_time: DateTime<Utc>,
    ) -> Result<ScheduleItem, ChatError> {
        let new_item = NewScheduleItem {
            title: title.to_string(),
            description: description.to_string(),
            date_time,
        };
        let item = match self.inner.schedule.create(new_item).await {
            Ok(item) => item,
            Err(e) => return Err(self.inner.record_schedule_error(e)),
        };
        self.inner.mirror_to_calendar(&item).await;
        self.inner.refresh_schedule().await;
        Ok(item)
    }

    pub async fn update_schedule_item(&self, item: &ScheduleItem) -> Result<(), ChatError> {
        if let Err(e) = self.inner.schedule.update(item).await {
            return Err(self.inner.record_schedule_error(e));
        }
        self.inner.refresh_schedule().await;
        Ok(())
    }

    pub async fn mark_schedule_item_completed(
        &self,
        id: Uuid,
        completed: bool,
    ) -> Result<(), ChatError> {
        if let Err(e) = self.inner.schedule.set_completed(id, completed).await {
            return Err(self.inner.record_schedule_error(e));
        }
        self.inner.refresh_schedule().await;
        Ok(())
    }

    pub async fn delete_schedule_item(&self, id: Uuid) -> Result<(), ChatError> {
        if let Err(e) = self.inner.schedule.delete(id).await {
            return Err(self.inner.record_schedule_error(e));
        }
        self.inner.refresh_schedule().await;
        Ok(())
    }

    /// Items falling on one local calendar day, earliest first.
    pub async fn schedule_for_date(&self, day: NaiveDate) -> Result<Vec<ScheduleItem>, ChatError> {
        self.inner
            .schedule
            .for_date(day)
            .await
            .map_err(|e| self.inner.record_schedule_error(e))
    }

    pub async fn has_calendar_permission(&self) -> bool {
        self.inner.calendar.has_permission().await
    }
}

impl Inner {
    fn generation(&self) -> u64 {
        self.conversation.borrow().generation
    }

    /// Override key if set, else the stored key.
    fn api_key(&self) -> String {
        let override_key = self
            .api_key_override
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(key) = override_key {
            return key;
        }
        match self.credentials.get() {
            Ok(key) => {
                if key.is_empty() {
                    warn!("No API key configured");
                }
                key
            }
            Err(e) => {
                warn!(error = %e, "Failed to read API key");
                String::new()
            }
        }
    }

    /// Profile and upcoming items folded into a system prompt. Store
    /// failures degrade to an emptier context.
    async fn system_context(&self) -> String {
        let profile = match self.profiles.get().await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Profile unavailable for context");
                UserProfile::default()
            }
        };
        let upcoming = match self
            .schedule
            .upcoming(Utc::now(), self.config.context_schedule_items)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Schedule unavailable for context");
                Vec::new()
            }
        };
        build_context(&profile, &upcoming)
    }

    async fn mirror_to_calendar(&self, item: &ScheduleItem) {
        if !self.calendar.has_permission().await {
            debug!(item_id = %item.id, "Calendar permission not granted");
            return;
        }
        let end = item.date_time + Duration::hours(EVENT_DURATION_HOURS);
        if self
            .calendar
            .add_event(&item.title, &item.description, item.date_time, end)
            .await
        {
            debug!(item_id = %item.id, "Event added to calendar");
        } else {
            warn!(item_id = %item.id, "Failed to add event to calendar");
        }
    }

    /// Save after an exchange; a failure lands in the conversation error.
    async fn persist_after_exchange(&self, generation: u64) {
        if let Err(e) = self.persist_session(generation).await {
            error!(error = %e, "Failed to save chat session");
            let message = e.to_string();
            self.conversation.send_if_modified(|s| {
                if s.generation != generation {
                    return false;
                }
                s.error = Some(message);
                true
            });
        }
    }

    async fn persist_session(&self, generation: u64) -> Result<(), ValetError> {
        let _persisting = self.persist_lock.lock().await;
        let (messages, session_id) = {
            let state = self.conversation.borrow();
            if state.generation != generation {
                return Ok(());
            }
            (state.messages.clone(), state.current_session_id)
        };
        if messages.is_empty() {
            return Ok(());
        }

        let saved = match session_id {
            Some(id) => match self.sessions.update(id, &messages).await? {
                Some(session) => session,
                None => {
                    warn!(session_id = %id, "Active session no longer stored; saving a new one");
                    self.sessions.create(&messages).await?
                }
            },
            None => self.sessions.create(&messages).await?,
        };

        self.conversation.send_if_modified(|s| {
            if s.generation != generation || s.current_session_id == Some(saved.id) {
                return false;
            }
            s.current_session_id = Some(saved.id);
            true
        });
        self.refresh_history().await;
        Ok(())
    }

    async fn refresh(&self, topic: StoreTopic) {
        match topic {
            StoreTopic::Sessions => self.refresh_history().await,
            StoreTopic::Schedule => self.refresh_schedule().await,
            StoreTopic::Profile => self.refresh_profile().await,
        }
    }

    async fn refresh_profile(&self) {
        match self.profiles.get().await {
            Ok(profile) => self.profile.send_modify(|s| s.profile = profile),
            Err(e) => {
                warn!(error = %e, "Failed to load profile");
                self.profile.send_modify(|s| s.error = Some(e.to_string()));
            }
        }
    }

    async fn refresh_schedule(&self) {
        match self.schedule.list().await {
            Ok(items) => {
                debug!(count = items.len(), "Schedule refreshed");
                self.schedule_state.send_modify(|s| s.items = items);
            }
            Err(e) => {
                warn!(error = %e, "Failed to load schedule");
                self.schedule_state
                    .send_modify(|s| s.error = Some(e.to_string()));
            }
        }
    }

    async fn refresh_history(&self) {
        match self.sessions.list().await {
            Ok(sessions) => {
                self.history.send_replace(sessions);
            }
            Err(e) => warn!(error = %e, "Failed to load chat history"),
        }
    }

    fn record_profile_error(&self, e: ValetError) -> ChatError {
        error!(error = %e, "Profile update failed");
        let message = e.to_string();
        self.profile.send_modify(|s| s.error = Some(message));
        e.into()
    }

    fn record_schedule_error(&self, e: ValetError) -> ChatError {
        error!(error = %e, "Schedule update failed");
        let message = e.to_string();
        self.schedule_state.send_modify(|s| s.error = Some(message));
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use tokio::sync::{broadcast, Notify};

    use valet_core::events::StoreEvent;
    use valet_core::store::ChangeFeed;
    use valet_core::types::{ChatSession, Message};
    use valet_storage::{Database, SqliteProfileStore, SqliteScheduleStore, SqliteSessionStore};

    use crate::context::DATE_TIME_FORMAT;
    use crate::error::CompletionError;

    const WAIT: StdDuration = StdDuration::from_secs(5);

    // ---- Fakes ----

    struct Call {
        api_key: String,
        history: Vec<Message>,
        new_message: String,
        context: Option<String>,
    }

    struct FakeCompletion {
        reply: Result<String, CompletionError>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
        seen: StdMutex<Vec<Call>>,
    }

    impl FakeCompletion {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                gate: None,
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
            }
        }

        fn failing(err: CompletionError) -> Self {
            Self {
                reply: Err(err),
                ..Self::replying("")
            }
        }

        fn gated(text: &str, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::replying(text)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionService for FakeCompletion {
        async fn complete(
            &self,
            api_key: &str,
            history: &[Message],
            new_message: &str,
            system_context: Option<&str>,
        ) -> Result<Message, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(Call {
                api_key: api_key.to_string(),
                history: history.to_vec(),
                new_message: new_message.to_string(),
                context: system_context.map(str::to_string),
            });
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.reply.clone().map(Message::assistant)
        }
    }

    struct RecordingCalendar {
        permitted: bool,
        events: StdMutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl CalendarSink for RecordingCalendar {
        async fn has_permission(&self) -> bool {
            self.permitted
        }

        async fn add_event(
            &self,
            title: &str,
            _description: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> bool {
            self.events
                .lock()
                .unwrap()
                .push((title.to_string(), start, end));
            true
        }
    }

    #[derive(Default)]
    struct MemoryCredentials(StdMutex<String>);

    impl CredentialStore for MemoryCredentials {
        fn get(&self) -> valet_core::Result<String> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn set(&self, key: &str) -> valet_core::Result<()> {
            *self.0.lock().unwrap() = key.to_string();
            Ok(())
        }

        fn clear(&self) -> valet_core::Result<()> {
            self.0.lock().unwrap().clear();
            Ok(())
        }
    }

    /// Schedule store whose every operation fails.
    struct BrokenSchedule {
        feed: ChangeFeed,
    }

    fn broken() -> ValetError {
        ValetError::Storage("disk full".to_string())
    }

    #[async_trait]
    impl ScheduleStore for BrokenSchedule {
        async fn create(&self, _item: NewScheduleItem) -> valet_core::Result<ScheduleItem> {
            Err(broken())
        }
        async fn update(&self, _item: &ScheduleItem) -> valet_core::Result<()> {
            Err(broken())
        }
        async fn set_completed(&self, _id: Uuid, _completed: bool) -> valet_core::Result<()> {
            Err(broken())
        }
        async fn delete(&self, _id: Uuid) -> valet_core::Result<()> {
            Err(broken())
        }
        async fn get(&self, _id: Uuid) -> valet_core::Result<Option<ScheduleItem>> {
            Err(broken())
        }
        async fn list(&self) -> valet_core::Result<Vec<ScheduleItem>> {
            Err(broken())
        }
        async fn upcoming(
            &self,
            _now: DateTime<Utc>,
            _limit: usize,
        ) -> valet_core::Result<Vec<ScheduleItem>> {
            Err(broken())
        }
        async fn for_date(&self, _day: chrono::NaiveDate) -> valet_core::Result<Vec<ScheduleItem>> {
            Err(broken())
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.feed.subscribe()
        }
    }

    /// Session store whose every operation fails.
    struct BrokenSessions {
        feed: ChangeFeed,
    }

    #[async_trait]
    impl SessionStore for BrokenSessions {
        async fn create(&self, _messages: &[Message]) -> valet_core::Result<ChatSession> {
            Err(broken())
        }
        async fn update(
            &self,
            _id: Uuid,
            _messages: &[Message],
        ) -> valet_core::Result<Option<ChatSession>> {
            Err(broken())
        }
        async fn delete(&self, _id: Uuid) -> valet_core::Result<()> {
            Err(broken())
        }
        async fn get(&self, _id: Uuid) -> valet_core::Result<Option<ChatSession>> {
            Err(broken())
        }
        async fn list(&self) -> valet_core::Result<Vec<ChatSession>> {
            Err(broken())
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.feed.subscribe()
        }
    }

    // ---- Harness ----

    struct Harness {
        orch: Orchestrator,
        completion: Arc<FakeCompletion>,
        calendar: Arc<RecordingCalendar>,
        credentials: Arc<MemoryCredentials>,
        sessions: Arc<SqliteSessionStore>,
        schedule: Arc<SqliteScheduleStore>,
    }

    fn harness(completion: FakeCompletion) -> Harness {
        build(completion, true, None, None)
    }

    fn build(
        completion: FakeCompletion,
        calendar_permitted: bool,
        schedule_override: Option<Arc<dyn ScheduleStore>>,
        sessions_override: Option<Arc<dyn SessionStore>>,
    ) -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let sessions = Arc::new(SqliteSessionStore::new(Arc::clone(&db)));
        let schedule = Arc::new(SqliteScheduleStore::new(Arc::clone(&db)));
        let profiles = Arc::new(SqliteProfileStore::new(Arc::clone(&db)));
        let completion = Arc::new(completion);
        let calendar = Arc::new(RecordingCalendar {
            permitted: calendar_permitted,
            events: StdMutex::new(Vec::new()),
        });
        let credentials = Arc::new(MemoryCredentials::default());
        credentials.set("sk-stored").unwrap();

        let schedule_store: Arc<dyn ScheduleStore> = match schedule_override {
            Some(store) => store,
            None => schedule.clone() as Arc<dyn ScheduleStore>,
        };
        let session_store: Arc<dyn SessionStore> = match sessions_override {
            Some(store) => store,
            None => sessions.clone() as Arc<dyn SessionStore>,
        };
        let orch = Orchestrator::new(
            Collaborators {
                sessions: session_store,
                schedule: schedule_store,
                profiles,
                credentials: credentials.clone(),
                completion: completion.clone(),
                calendar: calendar.clone(),
            },
            ChatConfig::default(),
        );

        Harness {
            orch,
            completion,
            calendar,
            credentials,
            sessions,
            schedule,
        }
    }

    fn state(orch: &Orchestrator) -> ConversationState {
        orch.conversation().borrow().clone()
    }

    async fn stored_sessions(h: &Harness) -> Vec<ChatSession> {
        h.sessions.list().await.unwrap()
    }

    // ---- Validation ----

    #[tokio::test]
    async fn test_blank_message_rejected_without_state_change() {
        let h = harness(FakeCompletion::replying("hi"));
        let err = h.orch.submit("   ").await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert_eq!(state(&h.orch), ConversationState::default());
    }

    #[tokio::test]
    async fn test_overlong_message_rejected() {
        let h = harness(FakeCompletion::replying("hi"));
        let text = "x".repeat(4001);
        let err = h.orch.submit(&text).await.unwrap_err();
        assert!(matches!(err, ChatError::MessageTooLong(4000)));
        assert_eq!(h.completion.calls(), 0);
    }

    // ---- Local path ----

    #[tokio::test]
    async fn test_schedule_command_handled_locally() {
        let h = harness(FakeCompletion::replying("unused"));
        let outcome = h
            .orch
            .submit("remind me to buy milk tomorrow at 9am")
            .await
            .unwrap();

        let item = match outcome {
            SubmitOutcome::Scheduled(item) => item,
            other => panic!("expected Scheduled, got {:?}", other),
        };
        assert_eq!(item.title, "buy milk");
        assert_eq!(h.completion.calls(), 0);

        let conv = state(&h.orch);
        assert_eq!(conv.messages.len(), 2);
        assert!(conv.messages[0].is_user_message);
        assert_eq!(conv.messages[0].content, "remind me to buy milk tomorrow at 9am");
        let expected = format!(
            "I've added \"buy milk\" to your schedule for {}.",
            item.date_time
                .with_timezone(&chrono::Local)
                .format(DATE_TIME_FORMAT)
        );
        assert_eq!(conv.messages[1].content, expected);
        assert!(conv.error.is_none());

        let stored = h.schedule.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(h.orch.schedule().borrow().items.len(), 1);

        let sessions = stored_sessions(&h).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(conv.current_session_id, Some(sessions[0].id));
        assert_eq!(h.orch.history().borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_command_mirrored_to_calendar() {
        let h = harness(FakeCompletion::replying("unused"));
        h.orch
            .submit("remind me to call mom at 3pm tomorrow")
            .await
            .unwrap();

        let events = h.calendar.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (title, start, end) = &events[0];
        assert_eq!(title, "call mom");
        assert_eq!(*end - *start, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_calendar_skipped_without_permission() {
        let h = build(FakeCompletion::replying("unused"), false, None, None);
        h.orch
            .submit("remind me to call mom at 3pm tomorrow")
            .await
            .unwrap();
        assert!(h.calendar.events.lock().unwrap().is_empty());
        assert!(!h.orch.has_calendar_permission().await);
    }

    #[tokio::test]
    async fn test_schedule_store_failure_reported() {
        let broken_store: Arc<dyn ScheduleStore> = Arc::new(BrokenSchedule {
            feed: ChangeFeed::new(),
        });
        let h = build(FakeCompletion::replying("unused"), true, Some(broken_store), None);

        let outcome = h
            .orch
            .submit("remind me to buy milk tomorrow at 9am")
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Failed(ref msg) if msg.contains("disk full")));

        let conv = state(&h.orch);
        assert!(conv.messages.is_empty());
        assert!(conv.error.as_deref().unwrap().contains("disk full"));
        assert!(h.orch.schedule().borrow().error.is_some());
        assert_eq!(h.completion.calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_command_falls_through_to_chat() {
        let h = harness(FakeCompletion::replying("Sure, when?"));
        let outcome = h.orch.submit("remind me to buy milk").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Replied(_)));
        assert_eq!(h.completion.calls(), 1);
        assert!(h.schedule.list().await.unwrap().is_empty());
    }

    // ---- Remote path ----

    #[tokio::test]
    async fn test_chat_reply_appended_and_saved() {
        let h = harness(FakeCompletion::replying("Hello! How can I help?"));
        let outcome = h.orch.submit("Hi there").await.unwrap();

        match outcome {
            SubmitOutcome::Replied(reply) => assert_eq!(reply.content, "Hello! How can I help?"),
            other => panic!("expected Replied, got {:?}", other),
        }

        let conv = state(&h.orch);
        assert_eq!(conv.messages.len(), 2);
        assert!(!conv.messages[1].is_user_message);
        assert!(conv.input_enabled);
        assert!(!conv.is_loading);

        let sessions = stored_sessions(&h).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Hi there");
        assert_eq!(sessions[0].messages.len(), 2);

        let seen = h.completion.seen.lock().unwrap();
        assert_eq!(seen[0].api_key, "sk-stored");
        assert!(seen[0].history.is_empty());
        assert_eq!(seen[0].new_message, "Hi there");
        assert_eq!(
            seen[0].context.as_deref(),
            Some("You are a personal assistant chatbot. ")
        );
    }

    #[tokio::test]
    async fn test_follow_up_updates_same_session() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.submit("first").await.unwrap();
        h.orch.submit("second").await.unwrap();

        let sessions = stored_sessions(&h).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].messages.len(), 4);

        let seen = h.completion.seen.lock().unwrap();
        assert_eq!(seen[1].history.len(), 2);
        assert_eq!(seen[1].history[0].content, "first");
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_message_and_sets_error() {
        let h = harness(FakeCompletion::failing(CompletionError::Api {
            code: 500,
            body: "boom".to_string(),
        }));
        let outcome = h.orch.submit("Hello?").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Failed("API Error: 500 - boom".to_string()));

        let conv = state(&h.orch);
        assert_eq!(conv.messages.len(), 1);
        assert!(conv.messages[0].is_user_message);
        assert_eq!(conv.error.as_deref(), Some("API Error: 500 - boom"));
        assert!(conv.input_enabled);
        assert!(!conv.is_loading);
        assert!(conv.current_session_id.is_none());
        assert!(stored_sessions(&h).await.is_empty());

        h.orch.clear_error();
        assert!(state(&h.orch).error.is_none());
    }

    #[tokio::test]
    async fn test_context_includes_profile_and_upcoming_items() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.update_profile("Ada", "", "engineer", "").await.unwrap();
        let when = Utc::now() + Duration::days(1);
        h.orch.add_schedule_item("Dentist", "", when).await.unwrap();

        h.orch.submit("What's on?").await.unwrap();

        let seen = h.completion.seen.lock().unwrap();
        let context = seen[0].context.clone().unwrap();
        assert!(context.starts_with(
            "You are a personal assistant chatbot. The user's name is Ada. They work as engineer. "
        ));
        assert!(context.contains("\n\nUpcoming schedule: \n- Dentist on "));
    }

    #[tokio::test]
    async fn test_api_key_override_wins() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.set_api_key_override(Some("sk-flag".to_string()));
        h.orch.submit("hi").await.unwrap();
        assert_eq!(h.completion.seen.lock().unwrap()[0].api_key, "sk-flag");

        h.orch.set_api_key_override(None);
        h.credentials.set("sk-rotated").unwrap();
        h.orch.submit("again").await.unwrap();
        assert_eq!(h.completion.seen.lock().unwrap()[1].api_key, "sk-rotated");
    }

    // ---- Concurrency ----

    #[tokio::test]
    async fn test_concurrent_submit_is_busy() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeCompletion::gated("done", gate.clone()));

        let orch = h.orch.clone();
        let first = tokio::spawn(async move { orch.submit("first").await });

        let mut rx = h.orch.conversation();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.is_loading))
            .await
            .unwrap()
            .unwrap();
        assert!(!state(&h.orch).input_enabled);

        let err = h.orch.submit("second").await.unwrap_err();
        assert!(matches!(err, ChatError::Busy));

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, SubmitOutcome::Replied(_)));
        assert_eq!(h.completion.calls(), 1);
        assert_eq!(state(&h.orch).messages.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_after_new_chat_is_discarded() {
        let gate = Arc::new(Notify::new());
        let h = harness(FakeCompletion::gated("late", gate.clone()));

        let orch = h.orch.clone();
        let pending = tokio::spawn(async move { orch.submit("hello").await });

        let mut rx = h.orch.conversation();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.is_loading))
            .await
            .unwrap()
            .unwrap();

        h.orch.create_new_chat();
        gate.notify_one();

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, SubmitOutcome::Discarded);

        let conv = state(&h.orch);
        assert!(conv.messages.is_empty());
        assert_eq!(conv.generation, 1);
        assert!(conv.input_enabled);
        assert!(stored_sessions(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_new_chat_is_discarded() {
        let gate = Arc::new(Notify::new());
        let failing = FakeCompletion {
            gate: Some(gate.clone()),
            ..FakeCompletion::failing(CompletionError::Api {
                code: 503,
                body: "overloaded".to_string(),
            })
        };
        let h = harness(failing);

        let orch = h.orch.clone();
        let pending = tokio::spawn(async move { orch.submit("hello").await });

        let mut rx = h.orch.conversation();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.is_loading))
            .await
            .unwrap()
            .unwrap();

        h.orch.create_new_chat();
        gate.notify_one();

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, SubmitOutcome::Discarded);

        let conv = state(&h.orch);
        assert!(conv.messages.is_empty());
        assert!(conv.error.is_none());
        assert!(conv.input_enabled);
        assert!(!conv.is_loading);
    }

    // ---- Sessions ----

    #[tokio::test]
    async fn test_session_save_failure_sets_error_and_keeps_messages() {
        let broken_sessions: Arc<dyn SessionStore> = Arc::new(BrokenSessions {
            feed: ChangeFeed::new(),
        });
        let h = build(
            FakeCompletion::replying("Hello!"),
            true,
            None,
            Some(broken_sessions),
        );

        let outcome = h.orch.submit("Hi there").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Replied(_)));

        let conv = state(&h.orch);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].content, "Hello!");
        assert!(conv.error.as_deref().unwrap().contains("disk full"));
        assert!(conv.current_session_id.is_none());
        assert!(conv.input_enabled);
    }

    #[tokio::test]
    async fn test_vanished_session_is_saved_anew() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.submit("first").await.unwrap();
        let original = state(&h.orch).current_session_id.unwrap();

        // Removed behind the orchestrator's back.
        h.sessions.delete(original).await.unwrap();

        h.orch.submit("second").await.unwrap();

        let conv = state(&h.orch);
        let replacement = conv.current_session_id.unwrap();
        assert_ne!(replacement, original);
        assert!(conv.error.is_none());

        let sessions = stored_sessions(&h).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, replacement);
        assert_eq!(sessions[0].messages.len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_saves_create_one_session() {
        let h = harness(FakeCompletion::failing(CompletionError::EmptyResponse));
        h.orch.submit("unsaved").await.unwrap();
        assert!(state(&h.orch).current_session_id.is_none());

        let (a, b) = tokio::join!(h.orch.save_current_chat(), h.orch.save_current_chat());
        a.unwrap();
        b.unwrap();

        let sessions = stored_sessions(&h).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(state(&h.orch).current_session_id, Some(sessions[0].id));
    }

    #[tokio::test]
    async fn test_load_unknown_session_leaves_state() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.submit("hi").await.unwrap();
        let before = state(&h.orch);

        let missing = Uuid::new_v4();
        let err = h.orch.load_chat_session(missing).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(id) if id == missing));
        assert_eq!(state(&h.orch), before);
    }

    #[tokio::test]
    async fn test_load_session_replaces_conversation() {
        let h = harness(FakeCompletion::replying("ok"));
        let saved = h
            .sessions
            .create(&[Message::user("old question"), Message::assistant("old answer")])
            .await
            .unwrap();

        h.orch.submit("current").await.unwrap();
        h.orch.load_chat_session(saved.id).await.unwrap();

        let conv = state(&h.orch);
        assert_eq!(conv.current_session_id, Some(saved.id));
        assert_eq!(conv.messages, saved.messages);
        assert_eq!(conv.generation, 1);

        // The next exchange updates the loaded session.
        h.orch.submit("follow up").await.unwrap();
        let reloaded = h.sessions.get(saved.id).await.unwrap().unwrap();
        assert_eq!(reloaded.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_delete_active_session_starts_new_chat() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.submit("hi").await.unwrap();
        let id = state(&h.orch).current_session_id.unwrap();

        h.orch.delete_chat_session(id).await.unwrap();

        let conv = state(&h.orch);
        assert!(conv.messages.is_empty());
        assert!(conv.current_session_id.is_none());
        assert!(h.orch.history().borrow().is_empty());
        assert!(stored_sessions(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_other_session_keeps_conversation() {
        let h = harness(FakeCompletion::replying("ok"));
        let other = h.sessions.create(&[Message::user("other")]).await.unwrap();
        h.orch.submit("hi").await.unwrap();

        h.orch.delete_chat_session(other.id).await.unwrap();
        assert_eq!(state(&h.orch).messages.len(), 2);
        assert_eq!(h.orch.history().borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_save_current_chat() {
        let h = harness(FakeCompletion::replying("ok"));
        // Nothing to save yet.
        h.orch.save_current_chat().await.unwrap();
        assert!(stored_sessions(&h).await.is_empty());

        h.orch.submit("hi").await.unwrap();
        h.orch.save_current_chat().await.unwrap();
        assert_eq!(stored_sessions(&h).await.len(), 1);
    }

    // ---- Profile and schedule screens ----

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.initialize().await;
        assert_eq!(h.orch.get_preference("tone", "formal"), "formal");

        h.orch.set_preference("tone", "casual").await.unwrap();
        assert_eq!(h.orch.get_preference("tone", "formal"), "casual");
    }

    #[tokio::test]
    async fn test_schedule_screen_operations() {
        let h = harness(FakeCompletion::replying("ok"));
        let when = Utc::now() + Duration::hours(2);
        let mut item = h.orch.add_schedule_item("Gym", "legs", when).await.unwrap();
        assert_eq!(h.calendar.events.lock().unwrap().len(), 1);

        h.orch.mark_schedule_item_completed(item.id, true).await.unwrap();
        assert!(h.orch.schedule().borrow().items[0].is_completed);
        h.orch.mark_schedule_item_completed(item.id, false).await.unwrap();
        assert!(!h.orch.schedule().borrow().items[0].is_completed);
        h.orch.mark_schedule_item_completed(item.id, true).await.unwrap();

        item.title = "Gym (upper body)".to_string();
        item.is_completed = true;
        h.orch.update_schedule_item(&item).await.unwrap();
        assert_eq!(h.orch.schedule().borrow().items[0].title, "Gym (upper body)");

        h.orch.delete_schedule_item(item.id).await.unwrap();
        assert!(h.orch.schedule().borrow().items.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_for_date() {
        use chrono::{Local, TimeZone};

        let h = harness(FakeCompletion::replying("ok"));
        let local = |d: u32, hour: u32| {
            Local
                .with_ymd_and_hms(2026, 3, d, hour, 0, 0)
                .earliest()
                .unwrap()
                .with_timezone(&Utc)
        };
        h.orch.add_schedule_item("Dentist", "", local(11, 15)).await.unwrap();
        h.orch.add_schedule_item("Gym", "", local(11, 7)).await.unwrap();
        h.orch.add_schedule_item("Flight", "", local(12, 9)).await.unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        let items = h.orch.schedule_for_date(day).await.unwrap();
        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Gym", "Dentist"]);
    }

    #[tokio::test]
    async fn test_schedule_for_date_failure_sets_error() {
        let broken_store: Arc<dyn ScheduleStore> = Arc::new(BrokenSchedule {
            feed: ChangeFeed::new(),
        });
        let h = build(FakeCompletion::replying("ok"), true, Some(broken_store), None);
        let day = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        assert!(h.orch.schedule_for_date(day).await.is_err());
        assert!(h.orch.schedule().borrow().error.is_some());
    }

    #[tokio::test]
    async fn test_schedule_screen_failure_sets_error() {
        let h = harness(FakeCompletion::replying("ok"));
        let err = h
            .orch
            .mark_schedule_item_completed(Uuid::new_v4(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
        assert!(h.orch.schedule().borrow().error.is_some());
    }

    // ---- Initialization and sync ----

    #[tokio::test]
    async fn test_initialize_loads_views() {
        let h = harness(FakeCompletion::replying("ok"));
        h.sessions.create(&[Message::user("saved")]).await.unwrap();
        h.schedule
            .create(NewScheduleItem {
                title: "Standup".to_string(),
                description: String::new(),
                date_time: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();

        h.orch.initialize().await;

        assert_eq!(h.orch.history().borrow().len(), 1);
        assert_eq!(h.orch.schedule().borrow().items.len(), 1);
        assert!(h.orch.profile().borrow().error.is_none());
    }

    #[tokio::test]
    async fn test_sync_follows_store_changes() {
        let h = harness(FakeCompletion::replying("ok"));
        h.orch.initialize().await;
        let handle = h.orch.start_sync();
        assert!(handle.is_running());

        h.schedule
            .create(NewScheduleItem {
                title: "Written elsewhere".to_string(),
                description: String::new(),
                date_time: Utc::now() + Duration::hours(3),
            })
            .await
            .unwrap();

        let mut schedule_rx = h.orch.schedule();
        tokio::time::timeout(WAIT, schedule_rx.wait_for(|s| s.items.len() == 1))
            .await
            .unwrap()
            .unwrap();

        h.sessions.create(&[Message::user("elsewhere")]).await.unwrap();
        let mut history_rx = h.orch.history();
        tokio::time::timeout(WAIT, history_rx.wait_for(|s| s.len() == 1))
            .await
            .unwrap()
            .unwrap();

        handle.stop();
    }
}
