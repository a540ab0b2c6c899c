//! Anthropic Messages API adapter.
//!
//! Each `generate` call sends the prompt as one user message and joins the
//! text blocks of the reply. The API key lives in a [`SecretString`] and
//! is only exposed when the request header is written.

use super::{factory::AdapterFactory, ModelAdapter, ModelError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable name for the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-haiku-4-5";
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Judge backend calling the Anthropic Messages API.
pub struct AnthropicAdapter {
    api_key: SecretString,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    http_timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_key(SecretString::from(api_key.into()))
    }

    pub fn from_env() -> Result<Self, ModelError> {
        Ok(Self::with_key(resolve_api_key(&JsonValue::Null)?))
    }

    /// Build from JSON config; `api_key` falls back to `ANTHROPIC_API_KEY`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ModelError> {
        let mut adapter = Self::with_key(resolve_api_key(config)?);
        if let Some(url) = config["base_url"].as_str() {
            adapter.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = config["model"].as_str() {
            adapter.model = model.to_string();
        }
        if let Some(max_tokens) = config["max_tokens"].as_u64() {
            adapter.max_tokens = u32::try_from(max_tokens).unwrap_or(u32::MAX);
        }
        if let Some(temperature) = config["temperature"].as_f64() {
            adapter.temperature = temperature as f32;
        }
        if let Some(timeout) = config["timeout"].as_str() {
            adapter.http_timeout = humantime::parse_duration(timeout)
                .map_err(|e| ModelError::NotConfigured(format!("invalid timeout: {}", e)))?;
        }
        Ok(adapter)
    }

    fn with_key(api_key: SecretString) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// The key from `api_key` in `config`, else from `ANTHROPIC_API_KEY`.
/// Blank keys count as missing.
fn resolve_api_key(config: &JsonValue) -> Result<SecretString, ModelError> {
    config["api_key"]
        .as_str()
        .map(str::to_owned)
        .or_else(|| std::env::var(ANTHROPIC_API_KEY_ENV).ok())
        .filter(|key| !key.trim().is_empty())
        .map(SecretString::from)
        .ok_or_else(|| {
            ModelError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in config or {} env",
                ANTHROPIC_API_KEY_ENV
            ))
        })
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: (self.temperature != 0.0).then_some(self.temperature),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(self.http_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.http_timeout)
                } else {
                    ModelError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ModelError::RateLimited { retry_after });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ModelError::AuthError);
        }

        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => status.to_string(),
            };
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ModelError::ParseError(e.to_string()))?;

        Ok(body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn health_check(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Builds [`AnthropicAdapter`] from configuration.
///
/// ```json
/// {
///   "api_key": "sk-ant-...",
///   "base_url": "https://...",
///   "model": "claude-haiku-4-5",
///   "max_tokens": 512,
///   "temperature": 0.0,
///   "timeout": "30s"
/// }
/// ```
pub struct AnthropicAdapterFactory;

impl AdapterFactory for AnthropicAdapterFactory {
    fn adapter_type(&self) -> &'static str {
        "anthropic"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelAdapter>, ModelError> {
        self.validate_config(config)?;
        Ok(Arc::new(AnthropicAdapter::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ModelError> {
        resolve_api_key(config)?;

        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ModelError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({
            "model": DEFAULT_MODEL,
            "max_tokens": DEFAULT_MAX_TOKENS
        })
    }

    fn description(&self) -> &'static str {
        "Anthropic Messages API judge"
    }
}
