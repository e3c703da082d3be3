//! Human review sources.
//!
//! A human reviewer is reached through a rendezvous: the pipeline sends a
//! [`PendingReview`] over a channel and waits on its oneshot reply, while the
//! UI side answers at its own pace.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use paper_core::{Error, HumanReviewMode, Result};

/// What a human reviewer is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanReviewRequest {
    /// Name of the reviewer conversation
    pub conversation: String,
    /// Fresh-looking performer response under review
    pub performer_response: String,
    /// Reply drafted by the LLM reviewer, if it was consulted first
    pub llm_suggestion: Option<String>,
}

/// Source of human review replies.
#[async_trait]
pub trait HumanReviewer: Send + Sync {
    /// Asks a human to review a performer response.
    ///
    /// # Errors
    /// Returns an error if the human side is unreachable.
    async fn review(&self, request: &HumanReviewRequest) -> Result<String>;
}

/// A review waiting for a human answer.
#[derive(Debug)]
pub struct PendingReview {
    /// What to show
    pub request: HumanReviewRequest,
    /// Where to send the answer
    pub reply: oneshot::Sender<String>,
}

/// Human reviewer reached over a tokio channel.
#[derive(Clone)]
pub struct ChannelHumanReviewer {
    /// Sender for pending reviews
    sender: mpsc::Sender<PendingReview>,
}

impl ChannelHumanReviewer {
    /// Creates a reviewer and the receiver the UI answers from.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingReview>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Creates a reviewer sending into an existing channel.
    pub const fn from_sender(sender: mpsc::Sender<PendingReview>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl HumanReviewer for ChannelHumanReviewer {
    async fn review(&self, request: &HumanReviewRequest) -> Result<String> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .send(PendingReview {
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::Other("human reviewer is no longer listening".to_owned()))?;
        debug!("[{}] waiting for human review", request.conversation);
        answer
            .await
            .map_err(|_| Error::Other("human reviewer dropped the review".to_owned()))
    }
}

/// How a human answer is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanDecision {
    /// Terminate the review as approved
    Approve,
    /// Ask the LLM reviewer instead
    DeferToLlm,
    /// Keep the LLM reviewer's reply as is
    AcceptLlm,
    /// Use this text as the reviewer's reply
    Feedback(String),
}

/// Interprets a human answer under a review mode.
///
/// With [`HumanReviewMode::HumanWithLlmUponRequest`] a blank answer or one
/// containing the termination phrase approves, and `AI`/`LLM` defers to the
/// LLM reviewer. With [`HumanReviewMode::LlmThenHuman`] a blank answer keeps
/// the LLM's reply and anything else replaces it.
pub fn classify_human_feedback(
    mode: HumanReviewMode,
    text: &str,
    termination_phrase: &str,
) -> HumanDecision {
    let trimmed = text.trim();
    match mode {
        HumanReviewMode::LlmOnly => HumanDecision::AcceptLlm,
        HumanReviewMode::LlmThenHuman if trimmed.is_empty() => HumanDecision::AcceptLlm,
        HumanReviewMode::LlmThenHuman => HumanDecision::Feedback(trimmed.to_owned()),
        HumanReviewMode::HumanWithLlmUponRequest => {
            if trimmed.is_empty() || trimmed.contains(termination_phrase) {
                HumanDecision::Approve
            } else if trimmed.eq_ignore_ascii_case("ai") || trimmed.eq_ignore_ascii_case("llm") {
                HumanDecision::DeferToLlm
            } else {
                HumanDecision::Feedback(trimmed.to_owned())
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

    const PHRASE: &str = "I hereby approve";

    #[test]
    fn test_human_first_mode() {
        let mode = HumanReviewMode::HumanWithLlmUponRequest;
        assert_eq!(classify_human_feedback(mode, "  ", PHRASE), HumanDecision::Approve);
        assert_eq!(
            classify_human_feedback(mode, "Fine. I hereby approve.", PHRASE),
            HumanDecision::Approve
        );
        assert_eq!(classify_human_feedback(mode, "AI", PHRASE), HumanDecision::DeferToLlm);
        assert_eq!(classify_human_feedback(mode, "llm", PHRASE), HumanDecision::DeferToLlm);
        assert_eq!(
            classify_human_feedback(mode, "Add units to the table", PHRASE),
            HumanDecision::Feedback("Add units to the table".to_owned())
        );
    }

    #[test]
    fn test_llm_then_human_mode() {
        let mode = HumanReviewMode::LlmThenHuman;
        assert_eq!(classify_human_feedback(mode, "", PHRASE), HumanDecision::AcceptLlm);
        assert_eq!(
            classify_human_feedback(mode, "Use a log scale", PHRASE),
            HumanDecision::Feedback("Use a log scale".to_owned())
        );
    }

    #[tokio::test]
    async fn test_channel_rendezvous() {
        let (reviewer, mut receiver) = ChannelHumanReviewer::new(1);
        let ui = tokio::spawn(async move {
            let pending = receiver.recv().await.unwrap();
            assert_eq!(pending.request.performer_response, "result");
            pending.reply.send("looks good".to_owned()).unwrap();
        });

        let answer = reviewer
            .review(&HumanReviewRequest {
                conversation: "reviewer".to_owned(),
                performer_response: "result".to_owned(),
                llm_suggestion: None,
            })
            .await
            .unwrap();
        assert_eq!(answer, "looks good");
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_ui_is_an_error() {
        let (reviewer, receiver) = ChannelHumanReviewer::new(1);
        drop(receiver);
        let result = reviewer
            .review(&HumanReviewRequest {
                conversation: "reviewer".to_owned(),
                performer_response: "result".to_owned(),
                llm_suggestion: None,
            })
            .await;
        assert!(matches!(result, Err(Error::Other(_))));
    }
}
