//! Configuration types for the LLM service, conversers, review, debugging and recording.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::llm::ModelEngine;
use crate::rewind::Rewind;
use crate::{Error, Result};

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "PAPER_LLM_API_KEY";

/// Complete pipeline configuration.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// LLM service configuration
    pub llm: LlmConfig,
    /// Result converser configuration
    pub converser: ConverserConfig,
    /// Dual-conversation review configuration
    pub review: ReviewConfig,
    /// Debugger configuration
    pub debugger: DebuggerConfig,
    /// Code revision configuration
    pub code: CodeRevisionConfig,
    /// LLM call recording configuration
    pub recording: RecordingConfig,
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if a value is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from a TOML file, falling back to defaults if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    /// Returns an error if the text cannot be parsed or a value is invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the pipeline loop forever or never run.
    ///
    /// # Errors
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let budgets = [
            ("llm.max_attempts", self.llm.max_attempts),
            (
                "converser.max_valid_response_iterations",
                self.converser.max_valid_response_iterations,
            ),
            ("review.max_reviewer_attempts", self.review.max_reviewer_attempts),
            ("debugger.max_debug_iterations", self.debugger.max_debug_iterations),
            ("code.max_code_writing_attempts", self.code.max_code_writing_attempts),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        if !(0.0..=1.0).contains(&self.debugger.small_change_min_ratio) {
            return Err(Error::Config(
                "debugger.small_change_min_ratio must be between 0 and 1".to_owned(),
            ));
        }
        if self.review.termination_phrase.trim().is_empty() {
            return Err(Error::Config(
                "review.termination_phrase must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// LLM service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible chat completions API
    pub base_url: String,
    /// API key; falls back to the `PAPER_LLM_API_KEY` environment variable
    pub api_key: Option<String>,
    /// Model identifier for [`ModelEngine::Fast`]
    pub fast_model: String,
    /// Model identifier for [`ModelEngine::FastLongContext`]
    pub fast_long_context_model: String,
    /// Model identifier for [`ModelEngine::Strong`]
    pub strong_model: String,
    /// Model identifier for [`ModelEngine::StrongLongContext`]
    pub strong_long_context_model: String,
    /// Tier used by conversers unless they override it
    pub default_engine: ModelEngine,
    /// Default sampling temperature
    pub temperature: Option<f64>,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Attempts per request on retryable server errors
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every further attempt
    pub initial_backoff_ms: u64,
}

impl LlmConfig {
    /// Model identifier for a tier.
    pub fn model_for(&self, engine: ModelEngine) -> &str {
        match engine {
            ModelEngine::Fast => &self.fast_model,
            ModelEngine::FastLongContext => &self.fast_long_context_model,
            ModelEngine::Strong => &self.strong_model,
            ModelEngine::StrongLongContext => &self.strong_long_context_model,
        }
    }

    /// Configured API key, or the one from the environment.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if neither is set.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|key| !key.is_empty()) {
            return Ok(key.clone());
        }
        env::var(API_KEY_ENV)
            .map_err(|_| Error::Config(format!("No API key configured and {API_KEY_ENV} not set")))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: None,
            fast_model: "gpt-4o-mini".to_owned(),
            fast_long_context_model: "gpt-4o-mini".to_owned(),
            strong_model: "gpt-4o".to_owned(),
            strong_long_context_model: "gpt-4o".to_owned(),
            default_engine: ModelEngine::Fast,
            temperature: None,
            timeout_seconds: 300,
            max_attempts: 5,
            initial_backoff_ms: 1000,
        }
    }
}

/// Result converser configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverserConfig {
    /// Attempts to obtain a valid response before giving up
    pub max_valid_response_iterations: u32,
    /// Rewind applied when a response fails semantic validation
    pub default_rewind_for_result_error: Rewind,
}

impl Default for ConverserConfig {
    fn default() -> Self {
        Self {
            max_valid_response_iterations: 4,
            default_rewind_for_result_error: Rewind::AsFresh,
        }
    }
}

/// Source of the reviewer's reply in a dual conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HumanReviewMode {
    /// Only the LLM reviews
    #[default]
    LlmOnly,
    /// The LLM reviews, then a human may accept or replace its reply
    LlmThenHuman,
    /// A human reviews and defers to the LLM on request
    HumanWithLlmUponRequest,
}

/// Dual-conversation review configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Review rounds before auto-approving
    pub max_reviewing_rounds: u32,
    /// Re-queries of an ambiguous reviewer reply
    pub max_reviewer_attempts: u32,
    /// Phrase a reviewer uses to approve
    pub termination_phrase: String,
    /// Who produces the reviewer's reply
    pub human_review_mode: HumanReviewMode,
    /// Whether the approving reply is posted back to the performer
    pub fold_approval_into_performer: bool,
    /// Rewind applied to the performer conversation once the review ends
    pub rewind_after_end_of_review: Rewind,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_reviewing_rounds: 3,
            max_reviewer_attempts: 3,
            termination_phrase: "I hereby approve".to_owned(),
            human_review_mode: HumanReviewMode::LlmOnly,
            fold_approval_into_performer: false,
            rewind_after_end_of_review: Rewind::AsFresh,
        }
    }
}

/// Debugger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Code submissions before restarting from scratch
    pub max_debug_iterations: u32,
    /// Wall-clock limit per sandbox run
    pub timeout_sec: u64,
    /// Minimum ratio of retained lines when a small change was requested
    pub small_change_min_ratio: f64,
    /// Maximum traceback length reported back to the model
    pub max_traceback_chars: usize,
    /// Python interpreter used by the process sandbox
    pub python: PathBuf,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            max_debug_iterations: 12,
            timeout_sec: 60,
            small_change_min_ratio: 0.9,
            max_traceback_chars: 2000,
            python: PathBuf::from("python3"),
        }
    }
}

/// Code revision configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeRevisionConfig {
    /// Full debugging sessions before the step fails
    pub max_code_writing_attempts: u32,
    /// Output-content review rounds
    pub max_code_revisions: u32,
    /// Whether to ask for an explanation of the accepted code
    pub explain_code: bool,
}

impl Default for CodeRevisionConfig {
    fn default() -> Self {
        Self {
            max_code_writing_attempts: 2,
            max_code_revisions: 3,
            explain_code: true,
        }
    }
}

/// How LLM calls are sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordingMode {
    /// Call the live service without recording
    #[default]
    Live,
    /// Call the live service and record every call
    Record,
    /// Serve recorded calls in order
    Replay,
}

/// LLM call recording configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recording mode
    pub mode: RecordingMode,
    /// Call log file, relative to the output directory
    pub llm_calls_file: PathBuf,
    /// Whether replay fails once recorded calls run out
    pub strict: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Live,
            llm_calls_file: PathBuf::from("llm_calls.json"),
            strict: true,
        }
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
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.converser.max_valid_response_iterations, 4);
        assert_eq!(config.review.max_reviewing_rounds, 3);
        assert_eq!(config.debugger.max_debug_iterations, 12);
        assert_eq!(config.debugger.max_traceback_chars, 2000);
        assert_eq!(config.code.max_code_writing_attempts, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [review]
            max_reviewing_rounds = 5
            human_review_mode = "LlmThenHuman"

            [recording]
            mode = "Replay"
            "#,
        )
        .unwrap();
        assert_eq!(config.review.max_reviewing_rounds, 5);
        assert_eq!(config.review.human_review_mode, HumanReviewMode::LlmThenHuman);
        assert_eq!(config.review.max_reviewer_attempts, 3);
        assert_eq!(config.recording.mode, RecordingMode::Replay);
        assert_eq!(config.debugger.timeout_sec, 60);
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let result = PipelineConfig::from_toml_str("[debugger]\nmax_debug_iterations = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = PipelineConfig::load_or_default(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_model_for_engine() {
        let config = LlmConfig::default();
        assert_eq!(config.model_for(ModelEngine::Strong), "gpt-4o");
    }

    #[test]
    fn test_configured_api_key_wins() {
        let config = LlmConfig {
            api_key: Some("key".to_owned()),
            ..LlmConfig::default()
        };
        assert_eq!(config.resolve_api_key().unwrap(), "key");
    }
}
