//! Chat model client (Ollama-style HTTP API).
//!
//! Streaming `/api/chat` responses are concatenated until `done: true`;
//! with chat disabled, a one-shot `/api/generate` is used instead.

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chat client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default)]
    pub num_predict: Option<u32>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    /// When false, history is ignored and `/api/generate` is used.
    #[serde(default = "default_use_chat")]
    pub use_chat: bool,
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_model() -> String {
    "golem:latest".to_string()
}

fn default_keep_alive() -> String {
    "30m".to_string()
}

fn default_temperature() -> f32 {
    0.6
}

fn default_num_ctx() -> u32 {
    8192
}

fn default_timeout_s() -> f64 {
    120.0
}

fn default_use_chat() -> bool {
    true
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            keep_alive: default_keep_alive(),
            temperature: default_temperature(),
            num_ctx: default_num_ctx(),
            num_predict: None,
            timeout_s: default_timeout_s(),
            use_chat: default_use_chat(),
        }
    }
}

/// One turn of conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// System-prompt message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// User message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_ctx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    keep_alive: &'a str,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Chat capability, mockable for dialogue tests.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce the assistant reply for the given context.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// HTTP client for the chat service.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    /// Build a client with the configured request timeout.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Startup probe: verify the configured model is present.
    pub async fn check_model(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base());
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ServiceError::Unhealthy(format!("LLM unreachable at {url}: {e}")))?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let wanted = &self.config.model;
        let found = tags
            .models
            .iter()
            .any(|m| &m.name == wanted || m.name.starts_with(&format!("{wanted}:")));
        if !found {
            return Err(ServiceError::Unhealthy(format!(
                "model {wanted} not available ({} models present)",
                tags.models.len()
            )));
        }
        info!(model = %wanted, "LLM model available");
        Ok(())
    }

    /// Streaming chat; chunks are concatenated until `done: true`.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.base());
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            keep_alive: &self.config.keep_alive,
            options: ChatOptions {
                temperature: self.config.temperature,
                num_ctx: self.config.num_ctx,
                num_predict: self.config.num_predict,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::Network(format!("LLM request: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Llm(format!(
                "LLM returned {}",
                response.status()
            )));
        }

        let mut reply = String::new();
        let mut pending = String::new();
        let mut stream = response.bytes_stream();
        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ServiceError::Network(format!("LLM stream: {e}")))?;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let parsed: ChatChunk = match serde_json::from_str(&line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping malformed stream line");
                        continue;
                    }
                };
                if let Some(message) = parsed.message {
                    reply.push_str(&message.content);
                }
                if parsed.done {
                    break 'outer;
                }
            }
        }
        debug!(chars = reply.len(), "chat stream complete");
        Ok(reply)
    }

    /// One-shot completion without conversation context.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base());
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            keep_alive: &self.config.keep_alive,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::Network(format!("LLM request: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError::Llm(format!(
                "LLM returned {}",
                response.status()
            )));
        }
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        Ok(body.response.unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        if !self.config.use_chat {
            let prompt = messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            return self.generate(prompt).await;
        }
        match self.chat_stream(messages).await {
            Ok(reply) => Ok(reply.trim().to_string()),
            Err(e) => {
                warn!(error = %e, "chat stream failed, falling back to one-shot");
                let prompt = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                self.generate(prompt).await
            }
        }
    }
}
