//! Named, ordered message sequences.
//!
//! A conversation is append-only in spirit: history is rewritten only by
//! truncating to a length and re-appending, never by editing in place. The
//! first message, when present, is always the system message.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};
use crate::{Error, Result};

/// Designates a position in a conversation.
///
/// Indices follow slice conventions: negative values count from the end and
/// out-of-range values are clamped to the conversation bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// Absolute index, negative counts from the end
    Index(isize),
    /// Most recent message carrying `tag`, shifted by `offset`
    Tag {
        /// Tag to anchor on
        tag: String,
        /// Offset relative to the tagged message
        offset: isize,
    },
    /// One past the last message
    End,
}

impl Position {
    /// Anchors on the most recent message tagged `tag`.
    pub fn tag<T: Into<String>>(tag: T) -> Self {
        Self::Tag {
            tag: tag.into(),
            offset: 0,
        }
    }

    /// Anchors on the most recent message tagged `tag`, shifted by `offset`.
    pub fn tag_offset<T: Into<String>>(tag: T, offset: isize) -> Self {
        Self::Tag {
            tag: tag.into(),
            offset,
        }
    }
}

impl From<isize> for Position {
    fn from(index: isize) -> Self {
        Self::Index(index)
    }
}

/// Clamps a signed index into `0..=len` using slice semantics.
fn clamp_index(index: isize, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs())
    } else {
        index.unsigned_abs().min(len)
    }
}

/// A named, ordered sequence of messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Registry-wide unique name
    name: String,
    /// Messages in order
    messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            messages: Vec::new(),
        }
    }

    /// Name of the conversation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Iterates over messages in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Message at `index`.
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// Most recent message.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Checks that `message` may follow the current messages.
    ///
    /// # Errors
    /// Returns an error if the system-first invariant would be broken.
    pub fn check_append(&self, message: &Message) -> Result<()> {
        match (self.messages.is_empty(), message.role) {
            (true, Role::System) | (false, Role::User | Role::Assistant) => Ok(()),
            (true, _) => Err(self.order_error("the first message must be a system message")),
            (false, Role::System) => {
                Err(self.order_error("a system message may only open the conversation"))
            }
        }
    }

    /// Appends a message.
    ///
    /// # Errors
    /// Returns an error if the system-first invariant would be broken.
    pub fn append(&mut self, message: Message) -> Result<()> {
        self.check_append(&message)?;
        self.messages.push(message);
        Ok(())
    }

    /// Resolves a position into an index in `0..=len`.
    ///
    /// # Errors
    /// Returns an error if a tag anchor matches no message.
    pub fn resolve(&self, position: &Position) -> Result<usize> {
        let len = self.messages.len();
        match position {
            Position::Index(index) => Ok(clamp_index(*index, len)),
            Position::End => Ok(len),
            Position::Tag { tag, offset } => {
                let anchor = self.last_tagged(tag).ok_or_else(|| Error::UnknownTag {
                    conversation: self.name.clone(),
                    tag: tag.clone(),
                })?;
                let shifted = isize::try_from(anchor)
                    .unwrap_or(isize::MAX)
                    .saturating_add(*offset);
                Ok(clamp_index(shifted.max(0), len))
            }
        }
    }

    /// Index of the most recent message tagged `tag`.
    pub fn last_tagged(&self, tag: &str) -> Option<usize> {
        self.messages.iter().rposition(|message| message.has_tag(tag))
    }

    /// Truncates to `len` messages, returning the removed ones.
    pub fn truncate(&mut self, len: usize) -> Vec<Message> {
        if len >= self.messages.len() {
            return Vec::new();
        }
        self.messages.split_off(len)
    }

    /// Deletes messages in `start..end`.
    ///
    /// Implemented as truncation to `start` followed by re-appending the
    /// retained tail, so the ordering invariant is checked on every message.
    ///
    /// # Errors
    /// Returns an error if a position cannot be resolved or the result would
    /// break the system-first invariant. The conversation is unchanged on error.
    pub fn delete_range(&mut self, start: &Position, end: &Position) -> Result<Vec<Message>> {
        let start_index = self.resolve(start)?;
        let end_index = self.resolve(end)?.max(start_index);
        if start_index == end_index {
            return Ok(Vec::new());
        }

        let mut rebuilt = Self::new(self.name.clone());
        for message in self.messages[..start_index]
            .iter()
            .chain(&self.messages[end_index..])
        {
            rebuilt.append(message.clone())?;
        }

        let removed = self.messages[start_index..end_index].to_vec();
        self.messages = rebuilt.messages;
        Ok(removed)
    }

    /// Most recent assistant message.
    ///
    /// # Errors
    /// Returns [`Error::NoResponse`] if the conversation has no assistant message.
    pub fn last_response(&self) -> Result<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
            .ok_or_else(|| Error::NoResponse(self.name.clone()))
    }

    /// Whether the last message was written by the assistant.
    pub fn ends_with_response(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|message| message.role == Role::Assistant)
    }

    fn order_error(&self, reason: &str) -> Error {
        Error::InvalidMessageOrder {
            conversation: self.name.clone(),
            reason: reason.to_owned(),
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

    fn sample() -> Conversation {
        let mut conversation = Conversation::new("test");
        conversation.append(Message::system("system")).unwrap();
        conversation
            .append(Message::user("request").with_tag("request"))
            .unwrap();
        conversation.append(Message::assistant("answer 1")).unwrap();
        conversation.append(Message::user("feedback")).unwrap();
        conversation.append(Message::assistant("answer 2")).unwrap();
        conversation
    }

    #[test]
    fn test_first_message_must_be_system() {
        let mut conversation = Conversation::new("test");
        let result = conversation.append(Message::user("hi"));
        assert!(matches!(result, Err(Error::InvalidMessageOrder { .. })));

        conversation.append(Message::system("sys")).unwrap();
        let second_system = conversation.append(Message::system("again"));
        assert!(second_system.is_err());
    }

    #[test]
    fn test_resolve_negative_and_clamped_indices() {
        let conversation = sample();
        assert_eq!(conversation.resolve(&Position::Index(-1)).unwrap(), 4);
        assert_eq!(conversation.resolve(&Position::Index(-100)).unwrap(), 0);
        assert_eq!(conversation.resolve(&Position::Index(100)).unwrap(), 5);
        assert_eq!(conversation.resolve(&Position::End).unwrap(), 5);
    }

    #[test]
    fn test_resolve_tag_with_offset() {
        let conversation = sample();
        assert_eq!(conversation.resolve(&Position::tag("request")).unwrap(), 1);
        assert_eq!(
            conversation
                .resolve(&Position::tag_offset("request", 1))
                .unwrap(),
            2
        );
        assert!(matches!(
            conversation.resolve(&Position::tag("missing")),
            Err(Error::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_delete_range_from_tag_to_last() {
        let mut conversation = sample();
        let removed = conversation
            .delete_range(&Position::tag_offset("request", 1), &Position::Index(-1))
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.messages()[2].content, "answer 2");
    }

    #[test]
    fn test_delete_range_rejects_removing_system_only() {
        let mut conversation = sample();
        let result = conversation.delete_range(&Position::Index(0), &Position::Index(1));
        assert!(result.is_err());
        assert_eq!(conversation.len(), 5);
    }

    #[test]
    fn test_last_response() {
        let conversation = sample();
        assert_eq!(conversation.last_response().unwrap().content, "answer 2");

        let mut empty = Conversation::new("empty");
        empty.append(Message::system("sys")).unwrap();
        assert!(matches!(empty.last_response(), Err(Error::NoResponse(_))));
    }

    #[test]
    fn test_truncate_returns_removed() {
        let mut conversation = sample();
        let removed = conversation.truncate(2);
        assert_eq!(removed.len(), 3);
        assert_eq!(conversation.len(), 2);
        assert!(conversation.truncate(10).is_empty());
    }
}
