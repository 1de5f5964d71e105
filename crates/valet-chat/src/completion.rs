//! Chat-completion client.
//!
//! Builds the OpenAI-style request payload, sends it through an
//! [`HttpTransport`], and maps the reply onto a [`Message`] or a
//! [`CompletionError`]. One request per call; no retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use valet_core::config::CompletionConfig;
use valet_core::types::Message;

use crate::error::CompletionError;

/// Raw HTTP reply handed back by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP seam: POST a JSON body with a bearer token.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        body: String,
    ) -> Result<HttpResponse, CompletionError>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| CompletionError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        body: String,
    ) -> Result<HttpResponse, CompletionError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", bearer_token))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// Anything that can turn a conversation into one assistant reply.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Request a reply to `new_message`, given the prior `history` and an
    /// optional system context.
    async fn complete(
        &self,
        api_key: &str,
        history: &[Message],
        new_message: &str,
        system_context: Option<&str>,
    ) -> Result<Message, CompletionError>;
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u32,
}

/// Build the message list: optional system context, history, new message.
pub fn build_messages(
    history: &[Message],
    new_message: &str,
    system_context: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(context) = system_context.filter(|c| !c.trim().is_empty()) {
        messages.push(ChatMessage::new("system", context));
    }
    messages.extend(
        history
            .iter()
            .map(|m| ChatMessage::new(m.role(), &m.content)),
    );
    messages.push(ChatMessage::new("user", new_message));
    messages
}

// =============================================================================
// CompletionClient
// =============================================================================

/// [`CompletionService`] speaking the chat-completions wire format.
pub struct CompletionClient {
    transport: Arc<dyn HttpTransport>,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: CompletionConfig) -> Self {
        Self { transport, config }
    }

    /// Send a tiny request to check that `api_key` is accepted.
    pub async fn validate_key(&self, api_key: &str) -> Result<(), CompletionError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage::new("user", "Say 'ok'")],
            max_tokens: 5,
            temperature: 0.0,
        };
        let response = self.send(api_key, &request).await?;
        let status = response.status;
        match status {
            401 => Err(CompletionError::InvalidApiKey),
            429 => Err(CompletionError::RateLimited),
            _ if response.is_success() => Ok(()),
            code => Err(CompletionError::Api {
                code,
                body: response.body,
            }),
        }
    }

    async fn send(
        &self,
        api_key: &str,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<HttpResponse, CompletionError> {
        let body = serde_json::to_string(request)
            .map_err(|e| CompletionError::Transport(format!("failed to encode request: {}", e)))?;
        self.transport
            .post_json(&self.config.endpoint, api_key, body)
            .await
    }
}

#[async_trait]
impl CompletionService for CompletionClient {
    async fn complete(
        &self,
        api_key: &str,
        history: &[Message],
        new_message: &str,
        system_context: Option<&str>,
    ) -> Result<Message, CompletionError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: build_messages(history, new_message, system_context),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            "Sending completion request"
        );

        let response = self.send(api_key, &request).await?;
        if !response.is_success() {
            warn!(status = response.status, "Completion request rejected");
            return Err(CompletionError::Api {
                code: response.status,
                body: response.body,
            });
        }
        if response.body.trim().is_empty() {
            return Err(CompletionError::EmptyResponse);
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&response.body)
            .map_err(|e| CompletionError::Transport(format!("failed to decode response: {}", e)))?;
        if let Some(usage) = &completion.usage {
            debug!(total_tokens = usage.total_tokens, "Completion usage");
        }

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| Message::assistant(choice.message.content))
            .ok_or(CompletionError::EmptyResponse)
    }
}
