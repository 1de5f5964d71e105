//! Calendar sinks for schedule items.
//!
//! Inserts are best-effort: a sink reports failure with `false` and the
//! caller logs it, nothing more.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Somewhere schedule items can be mirrored as calendar events.
#[async_trait]
pub trait CalendarSink: Send + Sync {
    async fn has_permission(&self) -> bool;

    /// Insert one event. Returns whether the insert succeeded.
    async fn add_event(
        &self,
        title: &str,
        description: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> bool;
}

/// Sink used when calendar integration is turned off. Never has permission.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCalendar;

#[async_trait]
impl CalendarSink for DisabledCalendar {
    async fn has_permission(&self) -> bool {
        false
    }

    async fn add_event(
        &self,
        _title: &str,
        _description: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> bool {
        false
    }
}

const CALENDAR_HEADER: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//valet//schedule//EN\r\n";
const CALENDAR_FOOTER: &str = "END:VCALENDAR\r\n";
const ICS_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Appends events to an iCalendar file that desktop calendars can subscribe to.
#[derive(Debug)]
pub struct IcsCalendar {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IcsCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let body = existing
            .strip_suffix(CALENDAR_FOOTER)
            .unwrap_or(&existing);
        let body = if body.is_empty() { CALENDAR_HEADER } else { body };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, format!("{}{}{}", body, event, CALENDAR_FOOTER)).await
    }
}

#[async_trait]
impl CalendarSink for IcsCalendar {
    async fn has_permission(&self) -> bool {
        true
    }

    async fn add_event(
        &self,
        title: &str,
        description: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> bool {
        let event = format_event(title, description, start, end, Utc::now());
        match self.append(&event).await {
            Ok(()) => {
                debug!(path = %self.path.display(), title, "Calendar event written");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write calendar event");
                false
            }
        }
    }
}

fn format_event(
    title: &str,
    description: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stamp: DateTime<Utc>,
) -> String {
    let mut event = String::from("BEGIN:VEVENT\r\n");
    event.push_str(&format!("UID:{}@valet\r\n", Uuid::new_v4()));
    event.push_str(&format!("DTSTAMP:{}\r\n", stamp.format(ICS_TIME_FORMAT)));
    event.push_str(&format!("DTSTART:{}\r\n", start.format(ICS_TIME_FORMAT)));
    event.push_str(&format!("DTEND:{}\r\n", end.format(ICS_TIME_FORMAT)));
    event.push_str(&format!("SUMMARY:{}\r\n", escape_text(title)));
    if !description.is_empty() {
        event.push_str(&format!("DESCRIPTION:{}\r\n", escape_text(description)));
    }
    event.push_str("END:VEVENT\r\n");
    event
}

/// Escape a TEXT value (RFC 5545 section 3.3.11).
fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}
