use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use intake_core::config::{LlmConfig, LlmProvider};
use intake_core::errors::OracleError;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String>;
}

/// Failure modes of a chat-completion call, carried inside `anyhow::Error`
/// so callers can classify them.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,
    #[error("llm provider rate limited or out of quota: {0}")]
    RateLimited(String),
    #[error("llm provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
}

impl LlmError {
    /// A timed-out request already spent the caller's whole budget, so it is
    /// never retried.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Timeout | Self::RateLimited(_) | Self::Decode(_) => false,
        }
    }
}

/// Maps an `LlmClient` failure onto the oracle error taxonomy.
pub fn classify_error(error: &anyhow::Error, timeout: Duration) -> OracleError {
    match error.downcast_ref::<LlmError>() {
        Some(LlmError::Timeout) => OracleError::Timeout(timeout),
        Some(LlmError::RateLimited(message)) => OracleError::Quota(message.clone()),
        Some(LlmError::Decode(message)) => OracleError::Malformed(message.clone()),
        Some(other) => OracleError::Transport(other.to_string()),
        None => OracleError::Transport(error.to_string()),
    }
}

/// Chat-completion client for OpenAI-compatible and Ollama endpoints.
pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
            LlmProvider::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn request_body<'a>(&'a self, system: &'a str, user: &'a str, temperature: f32) -> ChatRequest<'a> {
        let messages = vec![
            ChatMessage { role: "system", content: system },
            ChatMessage { role: "user", content: user },
        ];
        match self.provider {
            LlmProvider::OpenAi => ChatRequest {
                model: &self.model,
                messages,
                stream: false,
                temperature: Some(temperature),
                options: None,
            },
            LlmProvider::Ollama => ChatRequest {
                model: &self.model,
                messages,
                stream: false,
                temperature: None,
                options: Some(OllamaOptions { temperature }),
            },
        }
    }

    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<String, LlmError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::PAYMENT_REQUIRED {
            return Err(LlmError::RateLimited(text));
        }
        if !status.is_success() {
            return Err(LlmError::Status { status: status.as_u16(), body: text });
        }

        extract_content(self.provider, &text)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        let body = self.request_body(system, user, temperature);
        let mut attempt = 0;
        loop {
            match self.attempt(&body).await {
                Ok(content) => return Ok(content),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        event_name = "intake.llm.retry",
                        attempt,
                        error = %error,
                        "retrying llm request"
                    );
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com/v1",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn extract_content(provider: LlmProvider, raw: &str) -> Result<String, LlmError> {
    match provider {
        LlmProvider::OpenAi => {
            let parsed: OpenAiResponse =
                serde_json::from_str(raw).map_err(|error| LlmError::Decode(error.to_string()))?;
            parsed
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))
        }
        LlmProvider::Ollama => {
            let parsed: OllamaResponse =
                serde_json::from_str(raw).map_err(|error| LlmError::Decode(error.to_string()))?;
            Ok(parsed.message.content)
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use intake_core::config::{AppConfig, LlmProvider};
    use intake_core::errors::OracleError;

    use super::{classify_error, extract_content, HttpLlmClient, LlmError};

    #[test]
    fn openai_content_is_read_from_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"price\":\"10\"}"}}]}"#;
        let content = extract_content(LlmProvider::OpenAi, raw).expect("content");
        assert_eq!(content, r#"{"price":"10"}"#);
    }

    #[test]
    fn ollama_content_is_read_from_message() {
        let raw = r#"{"model":"llama3.1","message":{"role":"assistant","content":"hi"},"done":true}"#;
        assert_eq!(extract_content(LlmProvider::Ollama, raw).expect("content"), "hi");
    }

    #[test]
    fn empty_choices_are_a_decode_error() {
        let error = extract_content(LlmProvider::OpenAi, r#"{"choices":[]}"#).expect_err("decode");
        assert!(matches!(error, LlmError::Decode(_)));
    }

    #[test]
    fn errors_are_classified_for_the_oracle() {
        let timeout = Duration::from_secs(5);
        assert_eq!(
            classify_error(&LlmError::Timeout.into(), timeout),
            OracleError::Timeout(timeout)
        );
        assert!(matches!(
            classify_error(&LlmError::RateLimited("quota".to_string()).into(), timeout),
            OracleError::Quota(_)
        ));
        assert!(matches!(
            classify_error(&anyhow::anyhow!("socket closed"), timeout),
            OracleError::Transport(_)
        ));
    }

    #[test]
    fn only_connection_and_server_failures_are_retried() {
        assert!(LlmError::Transport("reset".to_string()).is_transient());
        assert!(LlmError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!LlmError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!LlmError::Timeout.is_transient(), "timeouts exhaust the oracle budget");
        assert!(!LlmError::RateLimited("quota".to_string()).is_transient());
    }

    #[test]
    fn ollama_request_carries_temperature_in_options() {
        let client = HttpLlmClient::from_config(&AppConfig::default().llm).expect("client");
        let body = serde_json::to_value(client.request_body("sys", "usr", 0.0)).expect("encode");

        assert_eq!(client.endpoint(), "http://localhost:11434/api/chat");
        assert_eq!(body["options"]["temperature"], 0.0);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][1]["content"], "usr");
    }
}
