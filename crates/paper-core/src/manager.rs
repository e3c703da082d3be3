//! Conversation manager mediating every mutation of one conversation.

use tracing::{debug, warn};

use crate::conversation::{Conversation, Position};
use crate::llm::{BumpModel, ChatMessage, LlmClient, LlmError, LlmRequest, LlmSettings};
use crate::message::{Message, Role};
use crate::registry::{Action, ActionsAndConversations};
use crate::{Error, Result};

/// Owns the mutation rights over a single named conversation.
///
/// Every append, delete and comment goes through the registry, so it is
/// recorded in the action log and mirrored to all observers.
#[derive(Clone)]
pub struct ConversationManager {
    /// Registry holding the conversation
    registry: ActionsAndConversations,
    /// Name of the managed conversation
    name: String,
}

impl ConversationManager {
    /// Manages the conversation `name`, creating it on first access.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be created.
    pub fn new(registry: ActionsAndConversations, name: &str) -> Result<Self> {
        registry.get_or_create(name)?;
        Ok(Self {
            registry,
            name: name.to_owned(),
        })
    }

    /// Manages a fresh conversation, renaming it on collision.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be created.
    pub fn with_unique_name(registry: ActionsAndConversations, name: &str) -> Result<Self> {
        let unique = registry.create_unique(name)?;
        Ok(Self {
            registry,
            name: unique,
        })
    }

    /// Name of the managed conversation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry the conversation lives in.
    pub fn registry(&self) -> &ActionsAndConversations {
        &self.registry
    }

    /// Copy of the conversation.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn conversation(&self) -> Result<Conversation> {
        self.registry.snapshot(&self.name)
    }

    /// Number of messages.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn len(&self) -> Result<usize> {
        self.registry.with_conversation(&self.name, Conversation::len)
    }

    /// Whether the conversation holds no messages.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Posts the system prompt if the conversation is still empty.
    ///
    /// # Errors
    /// Returns an error if the message cannot be appended.
    pub fn initialize(&self, system_prompt: &str) -> Result<()> {
        if self.is_empty()? {
            self.append(Message::system(system_prompt))?;
        }
        Ok(())
    }

    /// Appends a message.
    ///
    /// # Errors
    /// Returns an error if the message breaks the conversation ordering.
    pub fn append(&self, message: Message) -> Result<()> {
        self.registry.apply(Action::AppendMessage {
            conversation: self.name.clone(),
            message,
        })
    }

    /// Appends a system message. Only valid on an empty conversation.
    ///
    /// # Errors
    /// Returns an error if the conversation already holds messages.
    pub fn append_system<T: Into<String>>(&self, content: T) -> Result<()> {
        self.append(Message::system(content))
    }

    /// Appends a user message.
    ///
    /// # Errors
    /// Returns an error if the message breaks the conversation ordering.
    pub fn append_user<T: Into<String>>(&self, content: T, tag: Option<&str>) -> Result<()> {
        self.append(Message::user(content).with_optional_tag(tag))
    }

    /// Appends an assistant message written on the model's behalf.
    ///
    /// # Errors
    /// Returns an error if the message breaks the conversation ordering.
    pub fn append_assistant<T: Into<String>>(&self, content: T, tag: Option<&str>) -> Result<()> {
        self.append(Message::assistant(content).with_optional_tag(tag))
    }

    /// Deletes messages between two positions. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if a position cannot be resolved or the deletion
    /// would break the conversation ordering.
    pub fn delete_range(&self, start: &Position, end: &Position) -> Result<usize> {
        let (start_index, end_index) = self.registry.with_conversation(&self.name, |conversation| {
            let start_index = conversation.resolve(start)?;
            let end_index = conversation.resolve(end)?.max(start_index);
            Ok::<_, Error>((start_index, end_index))
        })??;
        if start_index == end_index {
            return Ok(0);
        }
        self.registry.apply(Action::DeleteMessages {
            conversation: self.name.clone(),
            start: start_index,
            end: end_index,
        })?;
        Ok(end_index - start_index)
    }

    /// Truncates to `len` messages. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn truncate(&self, len: usize) -> Result<usize> {
        let start = isize::try_from(len).unwrap_or(isize::MAX);
        self.delete_range(&Position::Index(start), &Position::End)
    }

    /// Replaces the content of the most recent assistant message, keeping its tag.
    ///
    /// # Errors
    /// Returns [`Error::NoResponse`] if there is no assistant message.
    pub fn replace_last_response(&self, content: &str) -> Result<()> {
        let conversation = self.conversation()?;
        let index = conversation
            .messages()
            .iter()
            .rposition(|message| message.role == Role::Assistant)
            .ok_or_else(|| Error::NoResponse(self.name.clone()))?;
        let tail: Vec<Message> = conversation.messages()[index + 1..].to_vec();
        let replaced = conversation.messages()[index].with_content(content);

        self.truncate(index)?;
        self.append(replaced)?;
        for message in tail {
            self.append(message)?;
        }
        Ok(())
    }

    /// Posts an observer-only comment; it never reaches the model.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn comment<T: Into<String>>(&self, text: T) -> Result<()> {
        self.registry.apply(Action::Comment {
            conversation: self.name.clone(),
            text: text.into(),
        })
    }

    /// Most recent assistant message.
    ///
    /// # Errors
    /// Returns [`Error::NoResponse`] if there is none.
    pub fn last_response(&self) -> Result<Message> {
        self.registry
            .with_conversation(&self.name, |conversation| {
                conversation.last_response().cloned()
            })?
    }

    /// Whether the conversation currently ends with an assistant message.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn ends_with_response(&self) -> Result<bool> {
        self.registry
            .with_conversation(&self.name, Conversation::ends_with_response)
    }

    /// Messages as they are sent to the model.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn request_messages(&self) -> Result<Vec<ChatMessage>> {
        self.registry.with_conversation(&self.name, |conversation| {
            conversation.iter().map(ChatMessage::from).collect()
        })
    }

    /// Requests a completion for the conversation and appends it as an assistant message.
    ///
    /// A context-window overflow bumps `settings` to a larger-context tier and
    /// retries while such a tier exists.
    ///
    /// # Errors
    /// Returns an error if the LLM service fails.
    pub async fn get_response(
        &self,
        llm: &dyn LlmClient,
        settings: &mut LlmSettings,
        tag: Option<&str>,
    ) -> Result<String> {
        loop {
            let request = LlmRequest::new(self.request_messages()?, settings);
            debug!(
                "[{}] requesting completion from {} ({} messages, ~{} tokens, engine {})",
                self.name,
                llm.name(),
                request.messages.len(),
                request.token_estimate(),
                request.engine
            );
            match llm.request(&request).await {
                Ok(content) => {
                    self.append_assistant(content.clone(), tag)?;
                    return Ok(content);
                }
                Err(LlmError::TokenLimit { engine, message })
                    if settings.bump(BumpModel::HigherContext) =>
                {
                    warn!("[{}] context window of {engine} exceeded ({message}); retrying", self.name);
                }
                Err(error) => return Err(error.into()),
            }
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
    use crate::llm::ModelEngine;
    use async_trait::async_trait;
    use core::result;
    use std::sync::Mutex;

    /// Client returning a token-limit error for the fast tier only.
    struct SmallContextClient {
        engines: Mutex<Vec<ModelEngine>>,
    }

    #[async_trait]
    impl LlmClient for SmallContextClient {
        fn name(&self) -> &str {
            "small-context"
        }

        async fn request(&self, request: &LlmRequest) -> result::Result<String, LlmError> {
            self.engines.lock().unwrap().push(request.engine);
            if request.engine == ModelEngine::Fast {
                return Err(LlmError::TokenLimit {
                    engine: request.engine,
                    message: "maximum context length exceeded".to_owned(),
                });
            }
            Ok("answer".to_owned())
        }
    }

    fn manager() -> ConversationManager {
        let manager = ConversationManager::new(ActionsAndConversations::new(), "code").unwrap();
        manager.initialize("system").unwrap();
        manager
    }

    #[test]
    fn test_truncate_and_delete_range() {
        let manager = manager();
        manager.append_user("request", Some("request")).unwrap();
        manager.append_assistant("a1", None).unwrap();
        manager.append_user("feedback", None).unwrap();
        manager.append_assistant("a2", None).unwrap();

        assert_eq!(manager.truncate(3).unwrap(), 2);
        assert_eq!(manager.len().unwrap(), 3);
        assert_eq!(manager.truncate(10).unwrap(), 0);

        assert_eq!(
            manager
                .delete_range(&Position::tag_offset("request", 1), &Position::End)
                .unwrap(),
            1
        );
        assert_eq!(manager.len().unwrap(), 2);
    }

    #[test]
    fn test_replace_last_response_keeps_tag() {
        let manager = manager();
        manager.append_user("request", None).unwrap();
        manager.append_assistant("messy answer", Some("code")).unwrap();

        manager.replace_last_response("clean answer").unwrap();

        let last = manager.last_response().unwrap();
        assert_eq!(last.content, "clean answer");
        assert!(last.has_tag("code"));
        assert_eq!(manager.len().unwrap(), 3);
    }

    #[test]
    fn test_comment_is_not_a_message() {
        let manager = manager();
        manager.comment("restarting").unwrap();
        assert_eq!(manager.len().unwrap(), 1);
        assert_eq!(manager.registry().action_count(), 3);
    }

    #[tokio::test]
    async fn test_get_response_bumps_context_on_token_limit() {
        let manager = manager();
        manager.append_user("request", None).unwrap();
        let client = SmallContextClient {
            engines: Mutex::new(Vec::new()),
        };
        let mut settings = LlmSettings::new(ModelEngine::Fast);

        let content = manager
            .get_response(&client, &mut settings, None)
            .await
            .unwrap();

        assert_eq!(content, "answer");
        assert_eq!(settings.engine, ModelEngine::FastLongContext);
        assert_eq!(
            *client.engines.lock().unwrap(),
            vec![ModelEngine::Fast, ModelEngine::FastLongContext]
        );
        assert!(manager.ends_with_response().unwrap());
    }
}
