//! CLI argument definitions and REPL command parsing for the Valet binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::Parser;
use uuid::Uuid;

/// Valet: a personal assistant chat that keeps your schedule.
#[derive(Parser, Debug)]
#[command(name = "valet", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Data directory for the database, credentials and calendar file.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// API key for the completion service. Not persisted.
    #[arg(long = "api-key")]
    pub api_key: Option<String>,
}

impl CliArgs {
    /// Priority: --config flag > VALET_CONFIG env var > ~/.valet/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_with(env_var)
    }

    fn resolve_config_path_with(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = env("VALET_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path(&env)
    }

    /// Priority: --data-dir flag > VALET_DATA_DIR env var > config file value.
    pub fn resolve_data_dir(&self, config_data_dir: &str) -> PathBuf {
        self.resolve_data_dir_with(config_data_dir, env_var)
    }

    fn resolve_data_dir_with(
        &self,
        config_data_dir: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> PathBuf {
        let raw = match (&self.data_dir, env("VALET_DATA_DIR")) {
            (Some(p), _) => p.to_string_lossy().to_string(),
            (None, Some(p)) => p,
            (None, None) => config_data_dir.to_string(),
        };
        expand_home(&raw, &env)
    }

    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_log_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_log_level.to_string())
    }

    /// Key that overrides the credential store for this run.
    ///
    /// Priority: --api-key flag > OPENAI_API_KEY env var. `None` means the
    /// stored key is used.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(env_var)
    }

    fn resolve_api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env("OPENAI_API_KEY"))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn home_dir(env: &impl Fn(&str) -> Option<String>) -> Option<String> {
    #[cfg(target_os = "windows")]
    return env("USERPROFILE");
    #[cfg(not(target_os = "windows"))]
    return env("HOME");
}

/// Default config file path for the current platform.
fn default_config_path(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    match home_dir(env) {
        Some(home) => PathBuf::from(home).join(".valet").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_home(path: &str, env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        let home = home_dir(env).unwrap_or_else(|| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

// =============================================================================
// REPL commands
// =============================================================================

/// Fields given to `/profile`. Unknown keys become preferences.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProfileEdit {
    pub name: Option<String>,
    pub birthday: Option<String>,
    pub occupation: Option<String>,
    pub hobbies: Option<String>,
    pub preferences: Vec<(String, String)>,
}

impl ProfileEdit {
    pub fn has_basic_fields(&self) -> bool {
        self.name.is_some()
            || self.birthday.is_some()
            || self.occupation.is_some()
            || self.hobbies.is_some()
    }
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    /// Plain text for the assistant.
    Say(String),
    New,
    History,
    Load(Uuid),
    Delete(Uuid),
    /// All items, or only those on one local day.
    Schedule(Option<NaiveDate>),
    /// A new item at a local date and time.
    Add { when: NaiveDateTime, title: String },
    Rename(Uuid, String),
    Remove(Uuid),
    Done(Uuid),
    Undone(Uuid),
    Profile(ProfileEdit),
    Key(String),
    Help,
    Quit,
    /// A slash command that could not be understood, with the reason.
    Invalid(String),
}

pub const HELP: &str = "\
Commands:
  /new                      start a new chat
  /history                  list saved chats
  /load <id>                open a saved chat
  /delete <id>              delete a saved chat
  /schedule [yyyy-mm-dd]    list schedule items, optionally for one day
  /add <yyyy-mm-dd> <hh:mm> <title>
                            add a schedule item
  /rename <id> <title>      retitle a schedule item
  /remove <id>              delete a schedule item
  /done <id>                mark a schedule item completed
  /undone <id>              mark a schedule item not completed
  /profile key=value;...    update name, birthday, occupation, hobbies or a preference
  /key <value>              validate and store the API key
  /help                     show this help
  /quit                     exit
Anything else is sent to the assistant.";

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return ReplCommand::Say(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        match name {
            "new" => ReplCommand::New,
            "history" => ReplCommand::History,
            "schedule" if arg.is_empty() => ReplCommand::Schedule(None),
            "schedule" => parse_date(arg)
                .map_or_else(ReplCommand::Invalid, |day| ReplCommand::Schedule(Some(day))),
            "add" => parse_add(arg),
            "rename" => parse_rename(arg),
            "help" => ReplCommand::Help,
            "quit" | "exit" => ReplCommand::Quit,
            "load" => parse_id(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Load),
            "delete" => parse_id(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Delete),
            "remove" => parse_id(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Remove),
            "done" => parse_id(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Done),
            "undone" => parse_id(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Undone),
            "key" if arg.is_empty() => ReplCommand::Invalid("usage: /key <value>".to_string()),
            "key" => ReplCommand::Key(arg.to_string()),
            "profile" => parse_profile(arg).map_or_else(ReplCommand::Invalid, ReplCommand::Profile),
            other => ReplCommand::Invalid(format!("unknown command: /{}", other)),
        }
    }
}

fn parse_id(arg: &str) -> Result<Uuid, String> {
    if arg.is_empty() {
        return Err("an id is required".to_string());
    }
    Uuid::parse_str(arg).map_err(|e| format!("invalid id {:?}: {}", arg, e))
}

fn parse_date(arg: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(arg, "%Y-%m-%d")
        .map_err(|e| format!("invalid date {:?} (expected yyyy-mm-dd): {}", arg, e))
}

fn parse_add(arg: &str) -> ReplCommand {
    const USAGE: &str = "usage: /add <yyyy-mm-dd> <hh:mm> <title>";
    let mut parts = arg.splitn(3, char::is_whitespace);
    let (Some(date), Some(time), Some(title)) = (parts.next(), parts.next(), parts.next()) else {
        return ReplCommand::Invalid(USAGE.to_string());
    };
    let title = title.trim();
    if title.is_empty() {
        return ReplCommand::Invalid(USAGE.to_string());
    }
    let day = match parse_date(date) {
        Ok(day) => day,
        Err(e) => return ReplCommand::Invalid(e),
    };
    let time = match NaiveTime::parse_from_str(time, "%H:%M") {
        Ok(time) => time,
        Err(e) => return ReplCommand::Invalid(format!("invalid time {:?}: {}", time, e)),
    };
    ReplCommand::Add {
        when: day.and_time(time),
        title: title.to_string(),
    }
}

fn parse_rename(arg: &str) -> ReplCommand {
    let Some((id, title)) = arg.split_once(char::is_whitespace) else {
        return ReplCommand::Invalid("usage: /rename <id> <title>".to_string());
    };
    match parse_id(id) {
        Ok(id) => ReplCommand::Rename(id, title.trim().to_string()),
        Err(e) => ReplCommand::Invalid(e),
    }
}

fn parse_profile(arg: &str) -> Result<ProfileEdit, String> {
    let mut edit = ProfileEdit::default();
    for pair in arg.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {:?}", pair))?;
        let key = key.trim();
        let value = value.trim().to_string();
        match key {
            "name" => edit.name = Some(value),
            "birthday" => edit.birthday = Some(value),
            "occupation" => edit.occupation = Some(value),
            "hobbies" => edit.hobbies = Some(value),
            "" => return Err(format!("missing key in {:?}", pair)),
            _ => edit.preferences.push((key.to_string(), value)),
        }
    }
    if !edit.has_basic_fields() && edit.preferences.is_empty() {
        return Err("usage: /profile name=..;occupation=..".to_string());
    }
    Ok(edit)
}
