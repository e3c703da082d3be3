//! LLM service contract.
//!
//! The model is an opaque text-completion service: an ordered list of
//! role-tagged messages goes in, a string comes out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::message::{Message, Role};

/// Substring used by providers to report that the prompt exceeded the context window.
pub const CONTENT_TOO_LONG_MARKER: &str = "maximum context length";

/// Model tier requested from the LLM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelEngine {
    /// Cheap, fast model
    Fast,
    /// Cheap model with a larger context window
    FastLongContext,
    /// Most capable model
    Strong,
    /// Most capable model with a larger context window
    StrongLongContext,
}

impl ModelEngine {
    /// Tier after applying an escalation signal, or `None` if already at the top.
    #[must_use]
    pub const fn bumped(self, bump: BumpModel) -> Option<Self> {
        match (bump, self) {
            (BumpModel::DoNotBump, engine) => Some(engine),
            (BumpModel::HigherStrength, Self::Fast) => Some(Self::Strong),
            (BumpModel::HigherStrength, Self::FastLongContext) => Some(Self::StrongLongContext),
            (BumpModel::HigherContext, Self::Fast) => Some(Self::FastLongContext),
            (BumpModel::HigherContext, Self::Strong) => Some(Self::StrongLongContext),
            (
                BumpModel::HigherStrength,
                Self::Strong | Self::StrongLongContext,
            )
            | (
                BumpModel::HigherContext,
                Self::FastLongContext | Self::StrongLongContext,
            ) => None,
        }
    }

    /// Stable identifier used in configuration and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::FastLongContext => "fast_long_context",
            Self::Strong => "strong",
            Self::StrongLongContext => "strong_long_context",
        }
    }
}

impl fmt::Display for ModelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation signal telling the caller to switch model tier before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BumpModel {
    /// Keep the current tier
    #[default]
    DoNotBump,
    /// Move to a more capable tier
    HigherStrength,
    /// Move to a tier with a larger context window
    HigherContext,
}

/// Per-conversation sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Tier to request
    pub engine: ModelEngine,
    /// Sampling temperature override
    pub temperature: Option<f64>,
    /// Nucleus sampling override
    pub top_p: Option<f64>,
    /// Completion length override
    pub max_tokens: Option<u32>,
}

impl LlmSettings {
    /// Settings for a given tier with provider defaults for sampling.
    #[must_use]
    pub const fn new(engine: ModelEngine) -> Self {
        Self {
            engine,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }

    /// Sets the temperature override.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Applies an escalation signal. Returns whether the tier changed.
    pub fn bump(&mut self, bump: BumpModel) -> bool {
        match self.engine.bumped(bump) {
            Some(engine) if engine != self.engine => {
                tracing::info!("Bumping model engine from {} to {}", self.engine, engine);
                self.engine = engine;
                true
            }
            _ => false,
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self::new(ModelEngine::Fast)
    }
}

/// A role/content pair as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the author
    pub role: Role,
    /// Text content
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Tier to use
    pub engine: ModelEngine,
    /// Sampling temperature override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Completion length override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Builds a request from messages and settings.
    pub fn new(messages: Vec<ChatMessage>, settings: &LlmSettings) -> Self {
        Self {
            messages,
            engine: settings.engine,
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
        }
    }

    /// Content of the last user message, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    /// Rough token estimate (four characters per token).
    pub fn token_estimate(&self) -> usize {
        self.messages
            .iter()
            .map(|message| message.content.len())
            .sum::<usize>()
            / 4
    }
}

/// Errors returned by LLM clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    /// The prompt does not fit the context window of the tier.
    #[error("Context window of '{engine}' exceeded: {message}")]
    TokenLimit {
        /// Tier that rejected the request
        engine: ModelEngine,
        /// Provider message
        message: String,
    },

    /// Transient server-side failure.
    #[error("Server error: {0}")]
    Server(String),

    /// Non-recoverable failure (authentication, malformed request, ...).
    #[error("Request failed: {0}")]
    Fatal(String),

    /// A strict replay run issued more calls than were recorded.
    #[error("Replay log exhausted after {0} recorded calls")]
    ReplayExhausted(usize),

    /// A replayed call does not match the recorded request.
    #[error("Replay mismatch at call {0}")]
    ReplayMismatch(usize),
}

impl LlmError {
    /// Classifies a provider error body.
    pub fn from_provider_message(engine: ModelEngine, message: String, retryable: bool) -> Self {
        if message.contains(CONTENT_TOO_LONG_MARKER) {
            Self::TokenLimit { engine, message }
        } else if retryable {
            Self::Server(message)
        } else {
            Self::Fatal(message)
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Server(_))
    }
}

/// A text-completion service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Identifier of the client, for logs.
    fn name(&self) -> &str;

    /// Requests a completion for the given conversation.
    ///
    /// # Errors
    /// Returns an [`LlmError`] describing whether the failure is a context
    /// overflow, a retryable server error or a fatal one.
    async fn request(&self, request: &LlmRequest) -> Result<String, LlmError>;
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

    #[test]
    fn test_bump_higher_strength() {
        assert_eq!(
            ModelEngine::Fast.bumped(BumpModel::HigherStrength),
            Some(ModelEngine::Strong)
        );
        assert_eq!(ModelEngine::Strong.bumped(BumpModel::HigherStrength), None);
    }

    #[test]
    fn test_bump_higher_context() {
        assert_eq!(
            ModelEngine::Strong.bumped(BumpModel::HigherContext),
            Some(ModelEngine::StrongLongContext)
        );
        assert_eq!(
            ModelEngine::FastLongContext.bumped(BumpModel::HigherContext),
            None
        );
    }

    #[test]
    fn test_settings_bump_reports_change() {
        let mut settings = LlmSettings::new(ModelEngine::Fast);
        assert!(!settings.bump(BumpModel::DoNotBump));
        assert!(settings.bump(BumpModel::HigherContext));
        assert_eq!(settings.engine, ModelEngine::FastLongContext);
        assert!(!settings.bump(BumpModel::HigherContext));
    }

    #[test]
    fn test_error_classification() {
        let error = LlmError::from_provider_message(
            ModelEngine::Fast,
            "This model's maximum context length is 16385 tokens".to_owned(),
            false,
        );
        assert!(matches!(error, LlmError::TokenLimit { .. }));

        let server = LlmError::from_provider_message(ModelEngine::Fast, "busy".to_owned(), true);
        assert!(server.is_retryable());

        let fatal = LlmError::from_provider_message(ModelEngine::Fast, "bad key".to_owned(), false);
        assert!(matches!(fatal, LlmError::Fatal(_)));
    }

    #[test]
    fn test_request_last_user_content() {
        let request = LlmRequest::new(
            vec![
                ChatMessage::from(&Message::system("sys")),
                ChatMessage::from(&Message::user("question")),
                ChatMessage::from(&Message::assistant("answer")),
            ],
            &LlmSettings::default(),
        );
        assert_eq!(request.last_user_content(), Some("question"));
    }
}
