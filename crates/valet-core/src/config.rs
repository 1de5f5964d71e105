use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, ValetError};

/// Top-level configuration for the Valet application.
///
/// Loaded from `~/.valet/config.toml` by default. Every section falls back
/// to its defaults when missing from the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValetConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

impl ValetConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ValetConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the rest of the system cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(ValetError::Config(format!(
                "completion.temperature must be within 0.0..=2.0, got {}",
                self.completion.temperature
            )));
        }
        if self.completion.max_tokens == 0 {
            return Err(ValetError::Config(
                "completion.max_tokens must be greater than 0".to_string(),
            ));
        }
        if self.completion.endpoint.trim().is_empty() {
            return Err(ValetError::Config(
                "completion.endpoint must not be empty".to_string(),
            ));
        }
        if self.chat.max_message_length == 0 {
            return Err(ValetError::Config(
                "chat.max_message_length must be greater than 0".to_string(),
            ));
        }
        if self.chat.session_title_chars == 0 {
            return Err(ValetError::Config(
                "chat.session_title_chars must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database and credentials file.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.valet/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Remote chat-completion service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Full URL of the chat-completions endpoint.
    pub endpoint: String,
    /// Model name sent with every request.
    pub model: String,
    /// Upper bound on generated tokens per reply.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 150,
            temperature: 0.7,
            timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

/// Conversation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Longest accepted user message, in characters.
    pub max_message_length: usize,
    /// Number of upcoming schedule items included in the system context.
    pub context_schedule_items: usize,
    /// Characters of the first user message kept in a session title.
    pub session_title_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            context_schedule_items: 3,
            session_title_chars: 30,
        }
    }
}

/// Calendar sink settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Whether schedule items are mirrored to a calendar sink.
    pub enabled: bool,
}
