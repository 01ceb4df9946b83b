//! Model client abstraction over a local Ollama server.
//!
//! The [`ModelClient`] trait keeps the loop controller independent of HTTP.
//! Each call is a pure function of the turns and parameters passed in; the
//! client holds no conversation state between calls.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::conversation::{Role, Turn};
use crate::core::types::GenerationParams;
use crate::error::BackendError;

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Abstraction over generative backends.
pub trait ModelClient {
    /// Return the raw text of the next assistant turn for `turns`.
    fn generate(
        &self,
        model: &str,
        turns: &[&Turn],
        params: &GenerationParams,
    ) -> Result<String, BackendError>;

    /// Names of the models the backend can serve.
    fn list_models(&self) -> Result<Vec<String>, BackendError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

impl From<&GenerationParams> for ChatOptions {
    fn from(params: &GenerationParams) -> Self {
        Self {
            temperature: params.temperature,
            num_predict: params.max_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

/// Ollama wire role for a turn. Tool results are fed back as user messages;
/// their content carries its own `[command result]` header.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User | Role::ToolResult => "user",
        Role::Assistant => "assistant",
    }
}

/// Accept `host:port` as well as full URLs, the way `OLLAMA_HOST` is usually written.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Blocking client for the Ollama HTTP API (`/api/chat`, `/api/tags`).
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::blocking::Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            warn!(timeout_ms = self.timeout.as_millis() as u64, "backend request timed out");
            return BackendError::Timeout(self.timeout);
        }
        let detail = format!("{:#}", anyhow::Error::from(err));
        warn!(detail = %detail, "backend request failed");
        BackendError::Unavailable(detail)
    }

    fn read_body(&self, response: reqwest::blocking::Response) -> Result<String, BackendError> {
        let status = response.status();
        let body = response.text().map_err(|err| self.classify(err))?;
        if status.is_success() {
            return Ok(body);
        }
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|api| api.error)
            .unwrap_or(body);
        Err(BackendError::Unavailable(format!(
            "ollama returned {status}: {}",
            message.trim()
        )))
    }
}

impl ModelClient for OllamaClient {
    #[instrument(skip_all, fields(model = %model, turns = turns.len()))]
    fn generate(
        &self,
        model: &str,
        turns: &[&Turn],
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        let request = ChatRequest {
            model,
            messages: turns
                .iter()
                .map(|turn| ChatMessage {
                    role: wire_role(turn.role),
                    content: &turn.content,
                })
                .collect(),
            stream: false,
            options: ChatOptions::from(params),
        };

        let url = format!("{}/api/chat", self.base_url);
        debug!(url = %url, "sending chat request");
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .map_err(|err| self.classify(err))?;
        let body = self.read_body(response)?;

        let chat: ChatResponse = serde_json::from_str(&body).map_err(|err| {
            BackendError::Unavailable(format!("unexpected chat response: {err}"))
        })?;
        debug!(chars = chat.message.content.len(), "received chat reply");
        Ok(chat.message.content)
    }

    #[instrument(skip_all)]
    fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| self.classify(err))?;
        let body = self.read_body(response)?;
        let tags: TagsResponse = serde_json::from_str(&body).map_err(|err| {
            BackendError::Unavailable(format!("unexpected tags response: {err}"))
        })?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }
}
