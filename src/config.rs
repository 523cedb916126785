//! LLM API configuration: server defaults from the environment, partial
//! updates sent by clients, validation and a masked view for status output.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::constants;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::OpenAi => "openai",
            ApiType::Gemini => "gemini",
        }
    }
}

impl FromStr for ApiType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ApiType::OpenAi),
            "gemini" => Ok(ApiType::Gemini),
            other => Err(Error::Config(format!("unsupported api type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_type: ApiType,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Model used by the evaluator. Falls back to `model` when unset.
    pub evaluator_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub nsfw_mode: bool,
}

/// Partial configuration as sent in an `api_config` WebSocket message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfigUpdate {
    pub api_type: Option<ApiType>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub evaluator_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub nsfw_mode: Option<bool>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::defaults_for(ApiType::OpenAi)
    }
}

impl ApiConfig {
    pub fn defaults_for(api_type: ApiType) -> Self {
        let (base_url, model) = match api_type {
            ApiType::OpenAi => (constants::OPENAI_BASE_URL.clone(), constants::OPENAI_MODEL.clone()),
            ApiType::Gemini => (constants::GEMINI_BASE_URL.clone(), constants::GEMINI_MODEL.clone()),
        };
        Self {
            api_type,
            api_key: None,
            base_url,
            model,
            evaluator_model: None,
            temperature: constants::DEFAULT_TEMPERATURE,
            max_tokens: constants::DEFAULT_MAX_TOKENS,
            timeout_secs: *constants::REQUEST_TIMEOUT_SECS,
            nsfw_mode: false,
        }
    }

    /// Server-side defaults. Clients may override any field per connection.
    pub fn from_env() -> Self {
        let api_type = env::var("EASYPROMPT_API_TYPE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(ApiType::OpenAi);
        let mut config = Self::defaults_for(api_type);

        config.api_key = match api_type {
            ApiType::OpenAi => first_env(&["EASYPROMPT_API_KEY", "DEEPSEEK_API_KEY", "OPENAI_API_KEY"]),
            ApiType::Gemini => first_env(&["EASYPROMPT_API_KEY", "GOOGLE_API_KEY"]),
        };
        config.evaluator_model = env::var("EASYPROMPT_EVALUATOR_MODEL").ok();
        config.nsfw_mode = env::var("EASYPROMPT_NSFW")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        config
    }

    /// Merge a client update. Switching api type without a base URL or model
    /// resets those to the new provider's defaults.
    pub fn apply(&mut self, update: ApiConfigUpdate) {
        if let Some(api_type) = update.api_type {
            if api_type != self.api_type {
                let defaults = Self::defaults_for(api_type);
                self.base_url = defaults.base_url;
                self.model = defaults.model;
                self.evaluator_model = None;
                self.api_type = api_type;
            }
        }
        if let Some(key) = update.api_key {
            self.api_key = Some(key);
        }
        if let Some(url) = update.base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(model) = update.model.filter(|m| !m.trim().is_empty()) {
            self.model = model;
        }
        if let Some(model) = update.evaluator_model {
            self.evaluator_model = Some(model).filter(|m| !m.trim().is_empty());
        }
        if let Some(t) = update.temperature {
            self.temperature = t;
        }
        if let Some(n) = update.max_tokens {
            self.max_tokens = n;
        }
        if let Some(nsfw) = update.nsfw_mode {
            self.nsfw_mode = nsfw;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| Error::Config(format!("{} config is missing {field}", self.api_type.as_str()));
        if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(missing("api_key"));
        }
        if self.model.trim().is_empty() {
            return Err(missing("model"));
        }
        if self.api_type == ApiType::OpenAi && self.base_url.trim().is_empty() {
            return Err(missing("base_url"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!("temperature {} out of range", self.temperature)));
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn evaluator_model(&self) -> &str {
        self.evaluator_model.as_deref().unwrap_or(&self.model)
    }

    /// Copy safe to show to clients: the key keeps only its first and last four characters.
    pub fn masked(&self) -> Self {
        let mut config = self.clone();
        config.api_key = self.api_key.as_ref().map(|key| {
            let chars: Vec<char> = key.chars().collect();
            if chars.len() > 8 {
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{head}...{tail}")
            } else {
                "****".to_string()
            }
        });
        config
    }
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

/// Load every file in `dir` into an environment variable named after the file.
/// Returns the number of variables set. A missing directory is not an error.
pub fn load_env_dir(dir: &Path) -> std::io::Result<usize> {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "No env directory, skipping");
        return Ok(0);
    }
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        match std::fs::read_to_string(entry.path()) {
            Ok(value) => {
                env::set_var(&name, value.trim());
                loaded += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "Skipping unreadable env file"),
        }
    }
    debug!(count = loaded, path = %dir.display(), "Loaded env directory");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ApiConfig {
        let mut config = ApiConfig::defaults_for(ApiType::OpenAi);
        config.api_key = Some("sk-1234567890abcdef".to_string());
        config
    }

    #[test]
    fn test_default_config_requires_key() {
        let config = ApiConfig::defaults_for(ApiType::OpenAi);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_apply_partial_update() {
        let mut config = configured();
        config.apply(ApiConfigUpdate {
            model: Some("gpt-4o".to_string()),
            temperature: Some(0.2),
            ..Default::default()
        });
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.api_key.as_deref(), Some("sk-1234567890abcdef"));
    }

    #[test]
    fn test_switching_api_type_resets_provider_defaults() {
        let mut config = configured();
        config.apply(ApiConfigUpdate {
            api_type: Some(ApiType::Gemini),
            api_key: Some("g-key-123456789".to_string()),
            ..Default::default()
        });
        assert_eq!(config.api_type, ApiType::Gemini);
        assert_eq!(config.base_url, *constants::GEMINI_BASE_URL);
        assert_eq!(config.model, *constants::GEMINI_MODEL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_evaluator_model_falls_back_to_model() {
        let mut config = configured();
        assert_eq!(config.evaluator_model(), config.model);
        config.evaluator_model = Some("deepseek-reasoner".to_string());
        assert_eq!(config.evaluator_model(), "deepseek-reasoner");
    }

    #[test]
    fn test_masked_key() {
        let masked = configured().masked();
        assert_eq!(masked.api_key.as_deref(), Some("sk-1...cdef"));

        let mut short = configured();
        short.api_key = Some("abc".to_string());
        assert_eq!(short.masked().api_key.as_deref(), Some("****"));
    }

    #[test]
    fn test_api_type_wire_names() {
        let update: ApiConfigUpdate = serde_json::from_str(r#"{"api_type":"openai","nsfw_mode":true}"#).unwrap();
        assert_eq!(update.api_type, Some(ApiType::OpenAi));
        assert_eq!(update.nsfw_mode, Some(true));
        assert!("GEMINI".parse::<ApiType>().is_ok());
        assert!("cohere".parse::<ApiType>().is_err());
    }

    #[test]
    fn test_load_env_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("EASYPROMPT_TEST_ENV_DIR_KEY"), "  secret-value\n").unwrap();
        let loaded = load_env_dir(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(env::var("EASYPROMPT_TEST_ENV_DIR_KEY").unwrap(), "secret-value");

        assert_eq!(load_env_dir(&dir.path().join("missing")).unwrap(), 0);
    }
}
