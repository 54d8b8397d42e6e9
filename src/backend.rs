//! Model backend
//!
//! The conversation core only needs one capability from a model server:
//! take an ordered list of messages and return one reply. `OllamaBackend`
//! provides it over Ollama's HTTP API, non-streaming.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::transcript::Turn;

/// One message in a chat request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
            images: turn.images.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Response(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Response(err.to_string())
        }
    }
}

/// Chat-completion service
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Single-shot completion over the full message history
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError>;

    /// Names of the models the backend can serve
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
}

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Ollama connection settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub url: String,
    /// Upper bound for a single HTTP request. Callers usually apply a tighter
    /// per-request deadline on top.
    pub request_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_OLLAMA_URL.to_string(),
            request_timeout: Duration::from_secs(600),
        }
    }
}

pub struct OllamaBackend {
    config: OllamaConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Check if Ollama is reachable
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError> {
        debug!("Ollama chat: model={} messages={}", model, messages.len());

        let response = self
            .client
            .post(self.endpoint("/api/chat"))
            .json(&ChatRequest {
                model,
                messages,
                stream: false,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Response(format!("Ollama error {}: {}", status, body)));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Response(format!("failed to parse Ollama response: {}", e)))?;

        Ok(result.message.content)
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self.client.get(self.endpoint("/api/tags")).send().await?;

        if !response.status().is_success() {
            return Err(BackendError::Response(format!(
                "Ollama tags request failed: {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Response(format!("failed to parse Ollama tags: {}", e)))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}
