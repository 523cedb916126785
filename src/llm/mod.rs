//! LLM backends behind one client enum.
//!
//! `LlmClient` dispatches to an OpenAI-compatible or a Gemini backend. Both
//! expose the same two calls: `stream_chat`, which forwards text deltas
//! through an mpsc channel while accumulating the full reply, and
//! `complete`, a single round trip. Conversation history is owned by the
//! caller and passed in on every call.

pub mod gemini;
pub mod openai;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::config::{ApiConfig, ApiType};
use crate::error::{Error, Result};

pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

/// Which of the three model jobs a call serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Conversation,
    Evaluator,
    Writer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LlmClient {
    OpenAi(OpenAiClient),
    Gemini(GeminiClient),
}

impl LlmClient {
    /// Validates the configuration and builds the matching backend.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.api_type {
            ApiType::OpenAi => LlmClient::OpenAi(OpenAiClient::new(config)?),
            ApiType::Gemini => LlmClient::Gemini(GeminiClient::new(config)?),
        })
    }

    pub fn api_type(&self) -> ApiType {
        match self {
            LlmClient::OpenAi(_) => ApiType::OpenAi,
            LlmClient::Gemini(_) => ApiType::Gemini,
        }
    }

    pub fn nsfw_mode(&self) -> bool {
        match self {
            LlmClient::OpenAi(c) => c.nsfw_mode(),
            LlmClient::Gemini(c) => c.nsfw_mode(),
        }
    }

    /// Stream a reply, sending each text delta to `tx`. Returns the full text.
    pub async fn stream_chat(
        &self,
        role: ModelRole,
        system: &str,
        history: &[ChatMessage],
        tx: &mpsc::Sender<String>,
    ) -> Result<String> {
        match self {
            LlmClient::OpenAi(c) => c.stream_chat(role, system, history, tx).await,
            LlmClient::Gemini(c) => c.stream_chat(role, system, history, tx).await,
        }
    }

    pub async fn complete(&self, role: ModelRole, system: &str, history: &[ChatMessage]) -> Result<String> {
        match self {
            LlmClient::OpenAi(c) => c.complete(role, system, history).await,
            LlmClient::Gemini(c) => c.complete(role, system, history).await,
        }
    }
}

// Error envelope shared by OpenAI-compatible APIs and Gemini
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Pass successful responses through; turn anything else into `Error::Api`.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|env| env.error.message)
        .unwrap_or(body);
    error!(%status, %message, "LLM API request failed");
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

/// `data` payloads of a `text/event-stream` response, in order. Comments,
/// empty events and `event:` lines are dropped by the decoder.
pub(crate) fn event_data(response: reqwest::Response) -> impl Stream<Item = Result<String>> {
    response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(EventStreamError::Transport(e)) => Some(Err(Error::from(e))),
                Err(e) => Some(Err(Error::Parse(format!("malformed event stream: {e}")))),
            }
        })
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(Error::from)
}
