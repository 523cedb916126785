// Google Gemini backend over the public REST API (`generateContent` and
// `streamGenerateContent?alt=sse`).

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{check_status, event_data, http_client, ChatMessage, ChatRole, ModelRole};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    evaluator_model: String,
    temperature: f32,
    nsfw_mode: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    system_instruction: Content<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safety_settings: Option<Vec<SafetySetting>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Debug)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize, Debug)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize, Debug)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Serialize, Debug)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Debug)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default()
    }
}

impl GeminiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(Error::NotConfigured)?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            evaluator_model: config.evaluator_model().to_string(),
            temperature: config.temperature,
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

    fn request<'a>(&self, role: ModelRole, system: &'a str, history: &'a [ChatMessage]) -> GenerateRequest<'a> {
        let contents = history
            .iter()
            .map(|m| Content {
                role: Some(match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "model",
                }),
                parts: vec![Part { text: &m.content }],
            })
            .collect();
        let safety_settings: Option<Vec<SafetySetting>> = self.nsfw_mode.then(|| {
            HARM_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: *category,
                    threshold: "BLOCK_NONE",
                })
                .collect()
        });
        // Only the writer is tuned by temperature, the other roles use model defaults
        let generation_config = (role == ModelRole::Writer).then_some(GenerationConfig {
            temperature: self.temperature,
        });
        GenerateRequest {
            contents,
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: system }],
            },
            safety_settings,
            generation_config,
        }
    }

    async fn send(&self, role: ModelRole, method: &str, payload: &GenerateRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/v1beta/models/{}:{}", self.base_url, self.model_for(role), method);
        let mut request = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(payload);
        if method == "streamGenerateContent" {
            request = request.query(&[("alt", "sse")]);
        }
        check_status(request.send().await?).await
    }

    #[instrument(skip(self, system, history, tx), fields(model = self.model_for(role)))]
    pub async fn stream_chat(
        &self,
        role: ModelRole,
        system: &str,
        history: &[ChatMessage],
        tx: &mpsc::Sender<String>,
    ) -> Result<String> {
        let payload = self.request(role, system, history);
        let response = self.send(role, "streamGenerateContent", &payload).await?;

        let mut events = std::pin::pin!(event_data(response));
        let mut full_text = String::new();

        while let Some(data) = events.next().await {
            if let Some(text) = chunk_text(&data?) {
                full_text.push_str(&text);
                let _ = tx.send(text).await;
            }
        }

        debug!(len = full_text.len(), "Stream finished");
        Ok(full_text)
    }

    #[instrument(skip(self, system, history), fields(model = self.model_for(role)))]
    pub async fn complete(&self, role: ModelRole, system: &str, history: &[ChatMessage]) -> Result<String> {
        let payload = self.request(role, system, history);
        let response = self.send(role, "generateContent", &payload).await?;
        let text = response.json::<GenerateResponse>().await?.text();
        if text.is_empty() {
            return Err(Error::Parse("response has no candidate text".to_string()));
        }
        debug!(len = text.len(), "Completion received");
        Ok(text)
    }
}

fn chunk_text(data: &str) -> Option<String> {
    match serde_json::from_str::<GenerateResponse>(data) {
        Ok(chunk) => Some(chunk.text()).filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(error = %e, "Skipping malformed stream chunk");
            None
        }
    }
}
