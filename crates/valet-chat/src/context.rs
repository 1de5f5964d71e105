//! System-prompt construction.
//!
//! Folds the stored profile and a few upcoming schedule items into the
//! system message sent ahead of the conversation history.

use chrono::{DateTime, Local, Utc};

use valet_core::types::{ScheduleItem, UserProfile};

const BASE_PROMPT: &str = "You are a personal assistant chatbot. ";
const SCHEDULE_HEADER: &str = "\n\nUpcoming schedule: ";

/// Display format for schedule instants, e.g. `Tue, Mar 10, 2026 at 3:00 PM`.
pub const DATE_TIME_FORMAT: &str = "%a, %b %-d, %Y at %-I:%M %p";

/// Format an instant in local time for prompts and confirmations.
pub fn format_date_time(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format(DATE_TIME_FORMAT)
        .to_string()
}

/// Build the system context from the profile and upcoming items.
///
/// Blank profile fields are skipped. Items are listed in the order given.
pub fn build_context(profile: &UserProfile, upcoming: &[ScheduleItem]) -> String {
    let mut context = String::from(BASE_PROMPT);

    let clauses = [
        (&profile.name, "The user's name is "),
        (&profile.occupation, "They work as "),
        (&profile.birthday, "Their birthday is "),
        (&profile.hobbies, "Their interests include "),
    ];
    for (value, lead) in clauses {
        if !value.trim().is_empty() {
            context.push_str(lead);
            context.push_str(value);
            context.push_str(". ");
        }
    }

    if !upcoming.is_empty() {
        context.push_str(SCHEDULE_HEADER);
        for item in upcoming {
            context.push_str(&format!(
                "\n- {} on {}",
                item.title,
                format_date_time(item.date_time)
            ));
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use uuid::Uuid;

    fn item(title: &str, local: DateTime<Local>) -> ScheduleItem {
        ScheduleItem {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: String::new(),
            date_time: local.with_timezone(&Utc),
            is_completed: false,
            created_at: Utc::now(),
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, mo, d)
                    .unwrap()
                    .and_hms_opt(h, mi, 0)
                    .unwrap(),
            )
            .earliest()
            .unwrap()
    }

    #[test]
    fn test_empty_profile_is_base_sentence() {
        let context = build_context(&UserProfile::default(), &[]);
        assert_eq!(context, "You are a personal assistant chatbot. ");
    }

    #[test]
    fn test_name_only_adds_one_clause() {
        let profile = UserProfile {
            name: "Ada".to_string(),
            ..UserProfile::default()
        };
        assert_eq!(
            build_context(&profile, &[]),
            "You are a personal assistant chatbot. The user's name is Ada. "
        );
    }

    #[test]
    fn test_all_fields_in_fixed_order() {
        let profile = UserProfile {
            name: "Ada".to_string(),
            birthday: "Dec 10".to_string(),
            occupation: "engineer".to_string(),
            hobbies: "chess".to_string(),
            ..UserProfile::default()
        };
        assert_eq!(
            build_context(&profile, &[]),
            "You are a personal assistant chatbot. The user's name is Ada. \
             They work as engineer. Their birthday is Dec 10. \
             Their interests include chess. "
        );
    }

    #[test]
    fn test_whitespace_fields_skipped() {
        let profile = UserProfile {
            occupation: "   ".to_string(),
            ..UserProfile::default()
        };
        assert_eq!(build_context(&profile, &[]), BASE_PROMPT);
    }

    #[test]
    fn test_upcoming_items_listed_in_order() {
        let items = vec![
            item("Dentist", local(2026, 3, 10, 15, 0)),
            item("Gym", local(2026, 3, 11, 7, 5)),
        ];
        let context = build_context(&UserProfile::default(), &items);
        assert_eq!(
            context,
            "You are a personal assistant chatbot. \n\nUpcoming schedule: \
             \n- Dentist on Tue, Mar 10, 2026 at 3:00 PM\
             \n- Gym on Wed, Mar 11, 2026 at 7:05 AM"
        );
    }

    #[test]
    fn test_format_date_time() {
        let when = local(2026, 1, 5, 0, 30).with_timezone(&Utc);
        assert_eq!(format_date_time(when), "Mon, Jan 5, 2026 at 12:30 AM");
    }
}
