use uuid::Uuid;

/// Change notifications published by the stores after every write.
///
/// Consumed by subscribers that keep a read model in sync with the
/// persisted records (the orchestrator's profile, schedule, and history
/// views).
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreEvent {
    /// A chat session was inserted.
    SessionCreated { session_id: Uuid },
    /// A chat session's messages were replaced.
    SessionUpdated { session_id: Uuid },
    /// A chat session was removed.
    SessionDeleted { session_id: Uuid },

    /// A schedule item was inserted.
    ScheduleItemCreated { item_id: Uuid },
    /// A schedule item was edited or its completion toggled.
    ScheduleItemUpdated { item_id: Uuid },
    /// A schedule item was removed.
    ScheduleItemDeleted { item_id: Uuid },

    /// The singleton profile changed.
    ProfileUpdated,
}

impl StoreEvent {
    /// Which read model this event invalidates.
    pub fn topic(&self) -> StoreTopic {
        match self {
            StoreEvent::SessionCreated { .. }
            | StoreEvent::SessionUpdated { .. }
            | StoreEvent::SessionDeleted { .. } => StoreTopic::Sessions,
            StoreEvent::ScheduleItemCreated { .. }
            | StoreEvent::ScheduleItemUpdated { .. }
            | StoreEvent::ScheduleItemDeleted { .. } => StoreTopic::Schedule,
            StoreEvent::ProfileUpdated => StoreTopic::Profile,
        }
    }
}

/// Coarse grouping of [`StoreEvent`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreTopic {
    Sessions,
    Schedule,
    Profile,
}
