use core::result;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use paper_core::{Error, LlmClient, LlmConfig, LlmError, LlmRequest, ModelEngine, Result};

/// Provider for OpenAI-compatible chat completion APIs.
pub struct OpenAiProvider {
    /// HTTP client for API requests.
    client: Client,
    /// Base URL, without the `/chat/completions` suffix.
    base_url: String,
    /// API key sent as a bearer token.
    api_key: String,
    /// Model identifiers per tier.
    models: [String; 4],
    /// Temperature used when a request does not override it.
    default_temperature: Option<f64>,
}

impl OpenAiProvider {
    /// Creates a provider from the LLM configuration.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the HTTP client cannot be built.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        if api_key.is_empty() {
            return Err(Error::Config("API key is empty".to_owned()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|err| Error::Config(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            models: [
                ModelEngine::Fast,
                ModelEngine::FastLongContext,
                ModelEngine::Strong,
                ModelEngine::StrongLongContext,
            ]
            .map(|engine| config.model_for(engine).to_owned()),
            default_temperature: config.temperature,
        })
    }

    /// Model identifier for a tier.
    fn model(&self, engine: ModelEngine) -> &str {
        let index = match engine {
            ModelEngine::Fast => 0,
            ModelEngine::FastLongContext => 1,
            ModelEngine::Strong => 2,
            ModelEngine::StrongLongContext => 3,
        };
        &self.models[index]
    }

    /// Builds the JSON request body.
    fn build_body(&self, request: &LlmRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".to_owned(), json!(self.model(request.engine)));
        body.insert("messages".to_owned(), json!(request.messages));
        if let Some(temperature) = request.temperature.or(self.default_temperature) {
            body.insert("temperature".to_owned(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_owned(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_owned(), json!(max_tokens));
        }
        Value::Object(body)
    }
}

/// Response payload returned by the chat completions API.
#[derive(Deserialize)]
struct CompletionResponse {
    /// List of generated choices.
    choices: Vec<Choice>,
}

/// Individual completion choice.
#[derive(Deserialize)]
struct Choice {
    /// Message payload representing the completion text.
    message: CompletionMessage,
}

/// Message structure containing generated content.
#[derive(Deserialize)]
struct CompletionMessage {
    /// Text content produced by the model.
    #[serde(default)]
    content: Option<String>,
}

/// Whether an HTTP status is worth retrying.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn request(&self, request: &LlmRequest) -> result::Result<String, LlmError> {
        let start = Instant::now();
        let body = self.build_body(request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    LlmError::Server(format!("Request failed: {err}"))
                } else {
                    LlmError::Fatal(format!("Request failed: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_provider_message(
                request.engine,
                format!("API request failed with status {status}: {error_text}"),
                is_retryable_status(status),
            ));
        }

        let api_response: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Server(format!("Failed to parse response: {err}")))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Server("No content in response".to_owned()))?;

        debug!(
            "{} answered in {}ms ({} chars)",
            self.model(request.engine),
            start.elapsed().as_millis(),
            text.len()
        );
        Ok(text)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::assertions_on_result_states,
    reason = "Tests unwrap and assert on results directly"
)]
mod tests {
    use super::*;
    use paper_core::{ChatMessage, LlmSettings, Message};

    fn config() -> LlmConfig {
        LlmConfig {
            api_key: Some("test_key".to_owned()),
            strong_model: "big-model".to_owned(),
            temperature: Some(0.2),
            ..LlmConfig::default()
        }
    }

    /// Tests that a configured API key and tier models are picked up.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_from_config_with_key() {
        let result = OpenAiProvider::from_config(&config());
        assert!(result.is_ok(), "Configured API key should succeed");
        if let Ok(provider) = result {
            assert_eq!(provider.api_key, "test_key");
            assert_eq!(provider.model(ModelEngine::Strong), "big-model");
            assert_eq!(provider.name(), "openai");
        }
    }

    /// Tests that the request body carries the tier's model and overrides.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_build_body() {
        let result = OpenAiProvider::from_config(&config());
        assert!(result.is_ok());
        if let Ok(provider) = result {
            let mut settings = LlmSettings::new(ModelEngine::Strong);
            settings.max_tokens = Some(100);
            let request = LlmRequest::new(
                vec![
                    ChatMessage::from(&Message::system("sys")),
                    ChatMessage::from(&Message::user("question")),
                ],
                &settings,
            );

            let body = provider.build_body(&request);
            assert_eq!(body["model"].as_str(), Some("big-model"));
            assert_eq!(body["messages"][0]["role"].as_str(), Some("system"));
            assert_eq!(body["messages"][1]["content"].as_str(), Some("question"));
            assert_eq!(body["temperature"].as_f64(), Some(0.2));
            assert_eq!(body["max_tokens"].as_u64(), Some(100));
            assert!(body.get("top_p").is_none());
        }
    }

    /// Tests which statuses are retried.
    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
