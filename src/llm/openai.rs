// OpenAI-compatible `/chat/completions` backend (OpenAI, DeepSeek, local
// servers). Wire types are private to this module.

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{check_status, event_data, http_client, ChatMessage, ChatRole, ModelRole};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    evaluator_model: String,
    temperature: f32,
    max_tokens: u32,
    nsfw_mode: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(Error::NotConfigured)?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            evaluator_model: config.evaluator_model().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            nsfw_mode: config.nsfw_mode,
        })
    }

    pub fn nsfw_mode(&self) -> bool {
        self.nsfw_mode
    }

    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Evaluator => &self.evaluator_model,
            ModelRole::Conversation | ModelRole::Writer => &self.model,
        }
    }

    fn request<'a>(
        &'a self,
        role: ModelRole,
        system: &'a str,
        history: &'a [ChatMessage],
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: system,
        });
        messages.extend(history.iter().map(|m| WireMessage {
            role: match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: &m.content,
        }));
        ChatCompletionRequest {
            model: self.model_for(role),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    async fn send(&self, payload: &ChatCompletionRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;
        check_status(response).await
    }

    #[instrument(skip(self, system, history, tx), fields(model = self.model_for(role)))]
    pub async fn stream_chat(
        &self,
        role: ModelRole,
        system: &str,
        history: &[ChatMessage],
        tx: &mpsc::Sender<String>,
    ) -> Result<String> {
        let payload = self.request(role, system, history, true);
        let response = self.send(&payload).await?;

        let mut events = std::pin::pin!(event_data(response));
        let mut full_text = String::new();

        while let Some(data) = events.next().await {
            let data = data?;
            if data == "[DONE]" {
                break;
            }
            if let Some(text) = delta_text(&data) {
                full_text.push_str(&text);
                // A closed receiver only means nobody is watching the stream
                let _ = tx.send(text).await;
            }
        }

        debug!(len = full_text.len(), "Stream finished");
        Ok(full_text)
    }

    #[instrument(skip(self, system, history), fields(model = self.model_for(role)))]
    pub async fn complete(&self, role: ModelRole, system: &str, history: &[ChatMessage]) -> Result<String> {
        let payload = self.request(role, system, history, false);
        let response = self.send(&payload).await?;
        let parsed: ChatCompletionResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| Error::Parse("response has no message content".to_string()))?;
        debug!(len = text.len(), "Completion received");
        Ok(text)
    }
}

fn delta_text(data: &str) -> Option<String> {
    match serde_json::from_str::<ChatCompletionResponse>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(error = %e, "Skipping malformed stream chunk");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_text() {
        let data = r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(delta_text(data).as_deref(), Some("Hel"));
        assert_eq!(delta_text(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(delta_text("not json"), None);
    }

    #[test]
    fn test_request_uses_evaluator_model() {
        let mut config = ApiConfig::default();
        config.api_key = Some("sk-test".to_string());
        config.model = "chat-model".to_string();
        config.evaluator_model = Some("judge-model".to_string());
        let client = OpenAiClient::new(&config).unwrap();
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];

        let req = client.request(ModelRole::Evaluator, "sys", &history, false);
        assert_eq!(req.model, "judge-model");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][2]["role"], "assistant");
        assert_eq!(json["stream"], false);

        let req = client.request(ModelRole::Writer, "sys", &history, true);
        assert_eq!(req.model, "chat-model");
    }
}
