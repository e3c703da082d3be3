use core::result::Result as CoreResult;
use std::io::Error as IoError;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::llm::LlmError;

/// Result type for core operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors that can occur in the conversation engine.
///
/// Problems with the *content* of an LLM response are never reported through
/// this type; they are expressed as validation outcomes and run issues and fed
/// back to the model.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The LLM service failed.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// The conversation holds no assistant message.
    #[error("Conversation '{0}' has no assistant response")]
    NoResponse(String),

    /// A position referred to a tag that no message carries.
    #[error("Conversation '{conversation}' has no message tagged '{tag}'")]
    UnknownTag {
        /// Name of the conversation that was searched
        conversation: String,
        /// Tag that was not found
        tag: String,
    },

    /// A message would break the system-first ordering of a conversation.
    #[error("Conversation '{conversation}': {reason}")]
    InvalidMessageOrder {
        /// Name of the conversation
        conversation: String,
        /// What went wrong
        reason: String,
    },

    /// No conversation is registered under this name.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// No stage checkpoint is recorded under this name.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// An iteration budget was exhausted without a usable result.
    #[error("Failed creating product: {0}")]
    FailedCreatingProduct(String),

    /// The code execution sandbox could not run the code at all.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Determines whether this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Llm(llm_error) if llm_error.is_retryable())
    }

    /// Whether this error marks an exhausted budget rather than a fault.
    pub fn is_failed_product(&self) -> bool {
        matches!(self, Self::FailedCreatingProduct(_))
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
    use serde_json::{Value as JsonValue, from_str};
    use std::io;

    #[test]
    fn test_error_display() {
        let error1 = Error::Config("invalid config".to_owned());
        assert_eq!(error1.to_string(), "Configuration error: invalid config");

        let error2 = Error::NoResponse("performer".to_owned());
        assert_eq!(
            error2.to_string(),
            "Conversation 'performer' has no assistant response"
        );

        let error3 = Error::FailedCreatingProduct("codes:data_analysis".to_owned());
        assert_eq!(
            error3.to_string(),
            "Failed creating product: codes:data_analysis"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        let error1 = Error::Llm(LlmError::Server("503".to_owned()));
        assert!(error1.is_retryable());

        let error2 = Error::Llm(LlmError::Fatal("bad key".to_owned()));
        assert!(!error2.is_retryable());

        let error3 = Error::Config("bad config".to_owned());
        assert!(!error3.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();
        assert!(matches!(error, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_error = from_str::<JsonValue>("invalid json").unwrap_err();
        let error: Error = json_error.into();
        assert!(matches!(error, Error::Json(_)));
    }

    #[test]
    fn test_failed_product_flag() {
        assert!(Error::FailedCreatingProduct("x".to_owned()).is_failed_product());
        assert!(!Error::Other("x".to_owned()).is_failed_product());
    }
}
