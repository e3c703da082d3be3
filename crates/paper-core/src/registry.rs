//! Process-wide registry of conversations and the actions applied to them.
//!
//! Conversations are a fold over the append-only action log: every mutation
//! is recorded as an [`Action`], and resetting to a stage truncates the log and
//! replays it from scratch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::conversation::Conversation;
use crate::message::Message;
use crate::observer::ConversationObserver;
use crate::{Error, Result};

/// A single recorded mutation (or comment) on a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// A conversation was created
    CreateConversation {
        /// Conversation name
        conversation: String,
    },
    /// A message was appended
    AppendMessage {
        /// Conversation name
        conversation: String,
        /// Appended message
        message: Message,
    },
    /// Messages `start..end` were removed
    DeleteMessages {
        /// Conversation name
        conversation: String,
        /// First removed index
        start: usize,
        /// One past the last removed index
        end: usize,
    },
    /// An observer-only note; never sent to the model
    Comment {
        /// Conversation name
        conversation: String,
        /// Comment text
        text: String,
    },
}

impl Action {
    /// Name of the conversation the action applies to.
    pub fn conversation(&self) -> &str {
        match self {
            Self::CreateConversation { conversation }
            | Self::AppendMessage { conversation, .. }
            | Self::DeleteMessages { conversation, .. }
            | Self::Comment { conversation, .. } => conversation,
        }
    }
}

/// Action-log length recorded when a stage started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    /// Stage name
    pub stage: String,
    /// Number of actions recorded before the stage started
    pub action_count: usize,
}

/// Mutable state behind the registry handle.
#[derive(Default)]
struct RegistryState {
    /// Conversations by name
    conversations: HashMap<String, Conversation>,
    /// Every action applied so far
    actions: Vec<Action>,
    /// Stage checkpoints in the order they were marked
    stages: Vec<StageCheckpoint>,
    /// Observers notified of every action
    observers: Vec<Arc<dyn ConversationObserver>>,
}

impl RegistryState {
    /// Applies an action to the conversations without recording it.
    fn execute(&mut self, action: &Action) -> Result<()> {
        match action {
            Action::CreateConversation { conversation } => {
                self.conversations
                    .entry(conversation.clone())
                    .or_insert_with(|| Conversation::new(conversation.clone()));
                Ok(())
            }
            Action::AppendMessage {
                conversation,
                message,
            } => self.conversation_mut(conversation)?.append(message.clone()),
            Action::DeleteMessages {
                conversation,
                start,
                end,
            } => {
                let target = self.conversation_mut(conversation)?;
                let start_index = isize::try_from(*start).unwrap_or(isize::MAX);
                let end_index = isize::try_from(*end).unwrap_or(isize::MAX);
                target.delete_range(&start_index.into(), &end_index.into())?;
                Ok(())
            }
            Action::Comment { conversation, .. } => {
                self.conversation_mut(conversation)?;
                Ok(())
            }
        }
    }

    fn conversation_mut(&mut self, name: &str) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(name)
            .ok_or_else(|| Error::ConversationNotFound(name.to_owned()))
    }
}

/// Shared handle to the conversations of a run.
///
/// Cloning the handle shares the underlying state. All access happens from
/// the single pipeline task, so the lock is never contended; it only makes
/// the handle shareable.
#[derive(Clone, Default)]
pub struct ActionsAndConversations {
    /// Shared registry state
    state: Arc<Mutex<RegistryState>>,
}

impl ActionsAndConversations {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer notified of every subsequent action.
    pub fn add_observer(&self, observer: Arc<dyn ConversationObserver>) {
        self.state().observers.push(observer);
    }

    /// Creates the conversation if it does not exist. Returns whether it was created.
    ///
    /// # Errors
    /// Returns an error if recording the creation fails.
    pub fn get_or_create(&self, name: &str) -> Result<bool> {
        if self.contains(name) {
            return Ok(false);
        }
        self.apply(Action::CreateConversation {
            conversation: name.to_owned(),
        })?;
        Ok(true)
    }

    /// Creates a new conversation, renaming it (`name_1`, `name_2`, ...) on collision.
    ///
    /// # Errors
    /// Returns an error if recording the creation fails.
    pub fn create_unique(&self, name: &str) -> Result<String> {
        let unique = {
            let state = self.state();
            let mut candidate = name.to_owned();
            let mut suffix = 0_usize;
            while state.conversations.contains_key(&candidate) {
                suffix += 1;
                candidate = format!("{name}_{suffix}");
            }
            candidate
        };
        self.apply(Action::CreateConversation {
            conversation: unique.clone(),
        })?;
        Ok(unique)
    }

    /// Whether a conversation with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.state().conversations.contains_key(name)
    }

    /// Names of all conversations, sorted.
    pub fn conversation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().conversations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of a conversation.
    ///
    /// # Errors
    /// Returns [`Error::ConversationNotFound`] if no such conversation exists.
    pub fn snapshot(&self, name: &str) -> Result<Conversation> {
        self.with_conversation(name, Clone::clone)
    }

    /// Runs `reader` against a conversation without copying it.
    ///
    /// # Errors
    /// Returns [`Error::ConversationNotFound`] if no such conversation exists.
    pub fn with_conversation<R>(&self, name: &str, reader: impl FnOnce(&Conversation) -> R) -> Result<R> {
        let state = self.state();
        let conversation = state
            .conversations
            .get(name)
            .ok_or_else(|| Error::ConversationNotFound(name.to_owned()))?;
        Ok(reader(conversation))
    }

    /// Applies, records and broadcasts an action.
    ///
    /// # Errors
    /// Returns an error if the action is invalid for the current conversation
    /// state. Invalid actions are neither recorded nor broadcast.
    pub fn apply(&self, action: Action) -> Result<()> {
        let observers = {
            let mut state = self.state();
            state.execute(&action)?;
            state.actions.push(action.clone());
            state.observers.clone()
        };
        for observer in &observers {
            observer.on_action(&action);
        }
        Ok(())
    }

    /// All actions recorded so far.
    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    /// Number of actions recorded so far.
    pub fn action_count(&self) -> usize {
        self.state().actions.len()
    }

    /// Records the start of a stage. Marking an existing stage moves its checkpoint.
    pub fn mark_stage(&self, stage: &str) -> StageCheckpoint {
        let mut state = self.state();
        let checkpoint = StageCheckpoint {
            stage: stage.to_owned(),
            action_count: state.actions.len(),
        };
        state.stages.retain(|existing| existing.stage != stage);
        state.stages.push(checkpoint.clone());
        checkpoint
    }

    /// Recorded stage checkpoints.
    pub fn stages(&self) -> Vec<StageCheckpoint> {
        self.state().stages.clone()
    }

    /// Discards everything recorded at or after the start of `stage`.
    ///
    /// # Errors
    /// Returns [`Error::UnknownStage`] if the stage was never marked, or an
    /// error if replaying the retained actions fails.
    pub fn reset_to_stage(&self, stage: &str) -> Result<()> {
        let checkpoint = self
            .state()
            .stages
            .iter()
            .find(|existing| existing.stage == stage)
            .cloned()
            .ok_or_else(|| Error::UnknownStage(stage.to_owned()))?;
        tracing::info!(
            "Resetting to stage '{}' ({} actions retained)",
            stage,
            checkpoint.action_count
        );
        self.reset_to(checkpoint.action_count)
    }

    /// Truncates the action log to `action_count` and rebuilds all conversations.
    ///
    /// # Errors
    /// Returns an error if replaying the retained actions fails.
    pub fn reset_to(&self, action_count: usize) -> Result<()> {
        let mut state = self.state();
        state.actions.truncate(action_count);
        state
            .stages
            .retain(|checkpoint| checkpoint.action_count <= action_count);
        state.conversations.clear();
        let retained = state.actions.clone();
        for action in &retained {
            state.execute(action)?;
        }
        Ok(())
    }

    /// Locks the state, recovering from poisoning.
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
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

    fn append(registry: &ActionsAndConversations, name: &str, message: Message) {
        registry
            .apply(Action::AppendMessage {
                conversation: name.to_owned(),
                message,
            })
            .unwrap();
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = ActionsAndConversations::new();
        assert!(registry.get_or_create("goal").unwrap());
        assert!(!registry.get_or_create("goal").unwrap());
        assert_eq!(registry.action_count(), 1);
    }

    #[test]
    fn test_create_unique_renames_collisions() {
        let registry = ActionsAndConversations::new();
        assert_eq!(registry.create_unique("review").unwrap(), "review");
        assert_eq!(registry.create_unique("review").unwrap(), "review_1");
        assert_eq!(registry.create_unique("review").unwrap(), "review_2");
        assert_eq!(
            registry.conversation_names(),
            vec!["review", "review_1", "review_2"]
        );
    }

    #[test]
    fn test_invalid_action_is_not_recorded() {
        let registry = ActionsAndConversations::new();
        registry.get_or_create("code").unwrap();
        let result = registry.apply(Action::AppendMessage {
            conversation: "code".to_owned(),
            message: Message::user("no system message yet"),
        });
        assert!(result.is_err());
        assert_eq!(registry.action_count(), 1);
    }

    #[test]
    fn test_reset_to_stage_replays_history() {
        let registry = ActionsAndConversations::new();
        registry.get_or_create("code").unwrap();
        append(&registry, "code", Message::system("sys"));
        append(&registry, "code", Message::user("goal"));

        registry.mark_stage("analysis");
        append(&registry, "code", Message::assistant("code v1"));
        registry.get_or_create("review").unwrap();
        registry
            .apply(Action::DeleteMessages {
                conversation: "code".to_owned(),
                start: 2,
                end: 3,
            })
            .unwrap();
        append(&registry, "code", Message::assistant("code v2"));

        registry.reset_to_stage("analysis").unwrap();
        let conversation = registry.snapshot("code").unwrap();
        assert_eq!(conversation.len(), 2);
        assert!(!registry.contains("review"));
        assert_eq!(registry.action_count(), 3);
    }

    #[test]
    fn test_reset_to_unknown_stage_fails() {
        let registry = ActionsAndConversations::new();
        assert!(matches!(
            registry.reset_to_stage("missing"),
            Err(Error::UnknownStage(_))
        ));
    }
}
