use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions framing the whole conversation
    System,
    /// Requests and feedback sent to the model
    User,
    /// Model responses (or surrogate responses written on its behalf)
    Assistant,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Role as seen from the other side of a dual conversation.
    ///
    /// The performer's answers reach the reviewer as requests and vice versa.
    #[must_use]
    pub const fn inverted(self) -> Self {
        match self {
            Self::System => Self::System,
            Self::User => Self::Assistant,
            Self::Assistant => Self::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation. Messages are never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message
    pub role: Role,
    /// Text content
    pub content: String,
    /// Optional tag used as an anchor for lookups and deletions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Background messages carry context rather than a request
    #[serde(default)]
    pub is_background: bool,
    /// Opaque context attached by the caller
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub context: JsonValue,
}

impl Message {
    /// Creates an untagged message.
    pub fn new<T: Into<String>>(role: Role, content: T) -> Self {
        Self {
            role,
            content: content.into(),
            tag: None,
            is_background: false,
            context: JsonValue::Null,
        }
    }

    /// Creates a system message.
    pub fn system<T: Into<String>>(content: T) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user<T: Into<String>>(content: T) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant<T: Into<String>>(content: T) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attaches a tag.
    #[must_use]
    pub fn with_tag<T: Into<String>>(mut self, tag: T) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Attaches an optional tag.
    #[must_use]
    pub fn with_optional_tag(mut self, tag: Option<&str>) -> Self {
        self.tag = tag.map(str::to_owned);
        self
    }

    /// Marks the message as background context.
    #[must_use]
    pub fn as_background(mut self) -> Self {
        self.is_background = true;
        self
    }

    /// Attaches opaque context.
    #[must_use]
    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    /// Returns a copy of this message with different content, keeping role and tag.
    #[must_use]
    pub fn with_content<T: Into<String>>(&self, content: T) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// Whether the message carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    /// Short single-line preview used in logs.
    pub fn preview(&self, max_chars: usize) -> String {
        let flat: String = self.content.replace('\n', " ");
        if flat.chars().count() <= max_chars {
            return flat;
        }
        let head: String = flat.chars().take(max_chars).collect();
        format!("{head}...")
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
    use serde_json::{from_str, json, to_string};

    #[test]
    fn test_role_inversion() {
        assert_eq!(Role::User.inverted(), Role::Assistant);
        assert_eq!(Role::Assistant.inverted(), Role::User);
        assert_eq!(Role::System.inverted(), Role::System);
    }

    #[test]
    fn test_message_builders() {
        let message = Message::user("hello")
            .with_tag("request")
            .as_background()
            .with_context(json!({"step": 1}));
        assert_eq!(message.role, Role::User);
        assert!(message.has_tag("request"));
        assert!(message.is_background);
        assert_eq!(message.context["step"], 1);
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let message = Message::assistant("ok");
        let json = to_string(&message).unwrap();
        assert!(!json.contains("tag"));
        assert!(!json.contains("context"));

        let parsed: Message = from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_preview_truncates() {
        let message = Message::user("line one\nline two");
        assert_eq!(message.preview(100), "line one line two");
        assert_eq!(message.preview(4), "line...");
    }
}
