use super::models::{Model, Usage};
use super::parse::{sanitize_api_response, truncate_str};
use crate::config::{Config, ModelIds};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One completion request: a system prompt plus the conversation.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: Model,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn new(model: Model, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model,
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
            json_mode: false,
        }
    }

    /// Ask the provider for a JSON object response.
    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Prepend prior conversation turns ahead of the current user message.
    pub fn with_history(mut self, history: &[ChatMessage]) -> Self {
        let mut messages = history.to_vec();
        messages.append(&mut self.messages);
        self.messages = messages;
        self
    }

    /// The last user message, the prompt body for this call.
    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Response from LLM including content and usage stats
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

/// A chat-completion provider.
pub trait LlmClient: Send + Sync {
    fn complete<'a>(&'a self, request: &'a LlmRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenRouterError {
    error: OpenRouterErrorBody,
}

#[derive(Deserialize)]
struct OpenRouterErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

/// Extract retry-after hint from OpenRouter response (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    (ms / 1000).max(1)
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// OpenRouter-compatible chat completions client.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
    models: ModelIds,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, url: impl Into<String>, models: ModelIds) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            url: url.into(),
            models,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "No API key configured. Set OPENROUTER_API_KEY or add it to {}",
                Config::config_location()
            )
        })?;
        Self::new(api_key, config.llm_base_url.clone(), config.models.clone())
    }

    async fn pause(retry_count: u32, hint: Option<u64>) {
        let secs = hint.unwrap_or_else(|| backoff_secs(retry_count));
        warn!(
            retry = retry_count,
            max = MAX_RETRIES,
            wait_secs = secs,
            "LLM request failed, backing off"
        );
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    /// Send with retry on network errors, 429, 5xx, and 200-with-error
    /// bodies. Returns the raw response text.
    async fn send_with_retry<T: Serialize>(&self, request_body: &T) -> anyhow::Result<String> {
        let mut retry_count = 0;

        loop {
            let response = match self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "mender")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(request_body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        Self::pause(retry_count, None).await;
                        continue;
                    }
                    return Err(anyhow::anyhow!("LLM request failed: {}", err));
                }
            };

            let status = response.status();
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        Self::pause(retry_count, None).await;
                        continue;
                    }
                    return Err(anyhow::anyhow!("Failed to read LLM response: {}", err));
                }
            };

            if status.is_success() {
                // Upstream provider failures sometimes arrive with a 200 status.
                if let Ok(err_resp) = serde_json::from_str::<OpenRouterError>(&text) {
                    let retryable = err_resp
                        .error
                        .code
                        .map(|c| c >= 500 || c == 429)
                        .unwrap_or(true);
                    if retryable && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        Self::pause(retry_count, None).await;
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "OpenRouter error: {}",
                        truncate_str(&err_resp.error.message, 200)
                    ));
                }
                return Ok(text);
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                Self::pause(retry_count, parse_retry_after(&text)).await;
                continue;
            }

            if status.is_server_error() && retry_count < MAX_RETRIES {
                retry_count += 1;
                Self::pause(retry_count, None).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
                429 => format!(
                    "Rate limited by the LLM provider after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "LLM provider server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, sanitize_api_response(&text)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }

    async fn complete_inner(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let system = ChatMessage::system(request.system.clone());
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(&system);
        messages.extend(request.messages.iter());

        let body = ChatRequest {
            model: request.model.id(&self.models),
            messages,
            max_tokens: request.model.max_tokens(),
            stream: false,
            response_format: request.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let text = self.send_with_retry(&body).await?;
        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse LLM response: {}\n{}",
                e,
                sanitize_api_response(&text)
            )
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        debug!(
            tier = request.model.label(),
            tokens = parsed.usage.as_ref().map(Usage::tokens).unwrap_or(0),
            "LLM call complete"
        );

        Ok(LlmResponse {
            content,
            usage: parsed.usage,
            model: parsed.model.unwrap_or_default(),
        })
    }
}

impl LlmClient for OpenRouterClient {
    fn complete<'a>(&'a self, request: &'a LlmRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>> {
        Box::pin(self.complete_inner(request))
    }
}
