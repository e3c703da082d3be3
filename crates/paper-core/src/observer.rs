//! Observers mirroring conversation actions to a UI, a log or an audit file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string};
use std::fs::{File, OpenOptions, read_to_string};
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Result;
use crate::registry::Action;

/// Receives every action applied to the registry it is attached to.
pub trait ConversationObserver: Send + Sync {
    /// Called after an action was applied and recorded.
    fn on_action(&self, action: &Action);
}

/// Mirrors actions into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConversationObserver for TracingObserver {
    fn on_action(&self, action: &Action) {
        match action {
            Action::CreateConversation { conversation } => {
                debug!("[{conversation}] created");
            }
            Action::AppendMessage {
                conversation,
                message,
            } => {
                debug!(
                    "[{conversation}] {} ({} chars): {}",
                    message.role,
                    message.content.len(),
                    message.preview(80)
                );
            }
            Action::DeleteMessages {
                conversation,
                start,
                end,
            } => {
                debug!("[{conversation}] deleted messages {start}..{end}");
            }
            Action::Comment { conversation, text } => {
                info!("[{conversation}] {text}");
            }
        }
    }
}

/// A line in the persisted action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggedAction {
    /// When the action was applied
    at: DateTime<Utc>,
    /// The action itself
    action: Action,
}

/// Appends one JSON line per action to a file.
pub struct ActionLogWriter {
    /// Buffered log file
    writer: Mutex<BufWriter<File>>,
}

impl ActionLogWriter {
    /// Opens (or creates) the log file for appending.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, action: &Action) -> Result<()> {
        let line = to_string(&LoggedAction {
            at: Utc::now(),
            action: action.clone(),
        })?;
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl ConversationObserver for ActionLogWriter {
    fn on_action(&self, action: &Action) {
        if let Err(error) = self.write_line(action) {
            warn!("Failed to write action log entry: {error}");
        }
    }
}

/// Reads a log written by [`ActionLogWriter`], in recorded order.
///
/// # Errors
/// Returns an error if the file cannot be read or a line cannot be parsed.
pub fn read_action_log(path: &Path) -> Result<Vec<Action>> {
    let contents = read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(from_str::<LoggedAction>(line)?.action))
        .collect()
}

/// Forwards actions to a channel, typically drained by a UI.
#[derive(Clone)]
pub struct ChannelObserver {
    /// Sending half of the UI channel
    sender: mpsc::UnboundedSender<Action>,
}

impl ChannelObserver {
    /// Creates an observer from an existing sender.
    pub fn from_sender(sender: mpsc::UnboundedSender<Action>) -> Self {
        Self { sender }
    }
}

impl ConversationObserver for ChannelObserver {
    /// Actions are dropped if the receiver has been closed.
    fn on_action(&self, action: &Action) {
        if let Err(error) = self.sender.send(action.clone()) {
            warn!("Failed to forward conversation action: {error}");
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
    use crate::message::Message;
    use crate::registry::ActionsAndConversations;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_action_log_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("actions.jsonl");
        let registry = ActionsAndConversations::new();
        registry.add_observer(Arc::new(ActionLogWriter::create(&path).unwrap()));

        registry.get_or_create("code").unwrap();
        registry
            .apply(Action::AppendMessage {
                conversation: "code".to_owned(),
                message: Message::system("sys"),
            })
            .unwrap();

        let actions = read_action_log(&path).unwrap();
        assert_eq!(actions, registry.actions());
    }

    #[tokio::test]
    async fn test_channel_observer_forwards_actions() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let registry = ActionsAndConversations::new();
        registry.add_observer(Arc::new(ChannelObserver::from_sender(sender)));

        registry.get_or_create("review").unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.conversation(), "review");
    }
}
