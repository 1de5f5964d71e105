//! Local schedule-command extraction.
//!
//! Recognises reminder/schedule utterances and pulls out a title, a date
//! and a time with a handful of regexes, so the orchestrator can create a
//! schedule item without a completion round-trip.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Local, NaiveTime, Timelike, Utc};
use regex::Regex;

/// A schedule entry recognised in free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCommand {
    pub title: String,
    /// The original utterance when it differs from the title, else empty.
    pub description: String,
    pub date_time: DateTime<Utc>,
}

// =============================================================================
// Compiled patterns
// =============================================================================

// Three-part numeric dates come before two-part ones so the whole date is matched.
// Whole words only: "may" must not match inside "mayor".
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:today|tomorrow|\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{1,2}[/-]\d{1,2}|january|february|march|april|may|june|july|august|september|october|november|december)\b",
    )
    .unwrap()
});

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})(?::(\d{2}))?(\s?[ap]m)?").unwrap());

static COMMAND_WORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)remind me (?:to|about) |add to schedule |schedule ").unwrap()
});

static PREPOSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:on|at|by)\s").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const MIN_TITLE_CHARS: usize = 4;
const SHORT_TITLE_CHARS: usize = 5;
const SHORT_TITLE_PREFIX: &str = "Reminder: ";

// =============================================================================
// Extraction
// =============================================================================

/// Whether the text reads as a request to add something to the schedule.
pub fn is_schedule_intent(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("remind me")
        || lower.contains("add to schedule")
        || (lower.contains("schedule") && (lower.contains("new") || lower.contains("add")))
}

/// Extract a schedule command relative to the current local time.
pub fn extract(text: &str) -> Option<ScheduleCommand> {
    extract_at(text, Local::now())
}

/// Extract a schedule command relative to `now`.
///
/// Returns `None` when the text is not a schedule intent, when neither a
/// date nor a time resolves, when the stripped title is too short, or when
/// the resulting local time is invalid.
pub fn extract_at(text: &str, now: DateTime<Local>) -> Option<ScheduleCommand> {
    if !is_schedule_intent(text) {
        return None;
    }

    let lower = text.to_lowercase();
    let date_match = DATE_RE.find(&lower).map(|m| m.as_str().to_string());
    let time_caps = TIME_RE.captures(&lower);

    let mut date = now.date_naive();
    let mut date_found = false;
    match date_match.as_deref() {
        Some("today") => date_found = true,
        Some("tomorrow") => {
            date = date + Duration::days(1);
            date_found = true;
        }
        // Numeric and month-name dates are recognised but not resolved.
        _ => {}
    }

    let mut time = now.time();
    let mut time_match = None;
    if let Some(caps) = &time_caps {
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute: u32 = match caps.get(2) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        let meridiem = caps.get(3).map(|m| m.as_str().trim());
        let hour = match meridiem {
            Some("pm") if hour < 12 => hour + 12,
            Some("am") if hour == 12 => 0,
            _ => hour,
        };
        time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        time_match = caps.get(0).map(|m| m.as_str().to_string());
    }
    let time_found = time_match.is_some();

    let title = strip_title(text, date_match.as_deref(), time_match.as_deref());
    let title_chars = title.chars().count();
    if title_chars < MIN_TITLE_CHARS || !(date_found || time_found) {
        return None;
    }
    let title = if title_chars < SHORT_TITLE_CHARS {
        format!("{}{}", SHORT_TITLE_PREFIX, text.trim())
    } else {
        title
    };

    // Whole seconds only; instants are stored at millisecond precision.
    let time = if time_found {
        time
    } else {
        time.with_nanosecond(0)?
    };
    let local = date.and_time(time).and_local_timezone(Local).earliest()?;

    let description = if text != title {
        text.to_string()
    } else {
        String::new()
    };

    Some(ScheduleCommand {
        title,
        description,
        date_time: local.with_timezone(&Utc),
    })
}

/// Remove command words, the matched date/time and prepositions.
fn strip_title(text: &str, date: Option<&str>, time: Option<&str>) -> String {
    let mut title = COMMAND_WORDS_RE.replace_all(text, "").into_owned();
    for fragment in [date, time].into_iter().flatten() {
        title = remove_all_ignore_case(&title, fragment);
    }
    let title = PREPOSITION_RE.replace_all(&title, "");
    WHITESPACE_RE.replace_all(title.trim(), " ").into_owned()
}

/// Remove every whole-word occurrence of `needle`, ignoring case.
fn remove_all_ignore_case(haystack: &str, needle: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(needle))) {
        Ok(re) => re.replace_all(haystack, "").into_owned(),
        Err(_) => haystack.to_string(),
    }
}
