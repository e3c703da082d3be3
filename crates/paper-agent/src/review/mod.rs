//! Performer/reviewer dialog.
//!
//! The performer conversation produces a response through a
//! [`ResultConverser`]; its fresh-looking form is posted as a user message to
//! the reviewer conversation, and the reviewer's reply comes back to the
//! performer as feedback. The two conversations advance in strict
//! alternation until the reviewer approves or the round budget runs out.

/// Human review sources.
pub mod human;

use std::sync::Arc;

use tracing::{debug, info, warn};

use paper_core::{
    ConversationManager, HumanReviewMode, LlmClient, LlmSettings, Result, ReviewConfig, Rewind,
};

use crate::converser::{ResultChecker, ResultConverser, is_bulleted_list};

pub use human::{
    ChannelHumanReviewer, HumanDecision, HumanReviewRequest, HumanReviewer, PendingReview,
    classify_human_feedback,
};

/// Appended to the reviewer's feedback before it reaches the performer.
pub const REVISION_REQUEST: &str = "Please correct your response according to my feedback, \
and send back a complete rewrite of it.";

/// Posted to the reviewer when the round budget runs out.
pub const MAX_ROUNDS_ACKNOWLEDGEMENT: &str = "Thank you for your feedback. \
We have gone through enough rounds of review; the result is good enough as it is.";

/// Where the dialog currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewState {
    /// The performer is producing a response
    #[default]
    SelfResponding,
    /// The reviewer is reviewing the performer's response
    OtherReviewing,
    /// The dialog is over
    Terminated,
}

/// Outcome of one review cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// The performer could not produce a valid response
    FailedCheckSelfResponse,
    /// The reviewer asked for changes
    NotApprovedByOther,
    /// The reviewer approved
    ApprovedByOther,
    /// The round budget ran out and the response was accepted as is
    MaxRoundsExceeded,
}

impl CycleStatus {
    /// Whether the dialog ends with this status.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::NotApprovedByOther)
    }
}

/// Classifies a reviewer reply.
///
/// Returns `Some(true)` when the reply contains the termination phrase and is
/// not a bulleted list, `None` when it contains the phrase but also lists
/// items (ambiguous), and `Some(false)` otherwise.
pub fn classify_reviewer_reply(reply: &str, termination_phrase: &str) -> Option<bool> {
    if !reply.contains(termination_phrase) {
        return Some(false);
    }
    if is_bulleted_list(reply) {
        None
    } else {
        Some(true)
    }
}

/// Two conversations reviewing each other's output.
pub struct DualConverser<C: ResultChecker> {
    /// Performer side, validating its own responses
    performer: ResultConverser<C>,
    /// Reviewer conversation
    reviewer: ConversationManager,
    /// LLM answering on the reviewer side
    reviewer_llm: Arc<dyn LlmClient>,
    /// Reviewer sampling settings
    reviewer_settings: LlmSettings,
    /// Round budget, termination phrase and review mode
    config: ReviewConfig,
    /// Human answering on the reviewer side, if any
    human: Option<Arc<dyn HumanReviewer>>,
    /// Completed non-approving rounds
    round_num: u32,
    /// Current state
    state: ReviewState,
    /// Approving reply of the last cycle, folded in once the dialog is rewound
    approval: Option<String>,
}

impl<C: ResultChecker> DualConverser<C> {
    /// Pairs a performer with a reviewer conversation.
    ///
    /// The reviewer conversation is expected to hold its system prompt already.
    pub fn new(
        performer: ResultConverser<C>,
        reviewer: ConversationManager,
        reviewer_llm: Arc<dyn LlmClient>,
        reviewer_settings: LlmSettings,
        config: ReviewConfig,
    ) -> Self {
        Self {
            performer,
            reviewer,
            reviewer_llm,
            reviewer_settings,
            config,
            human: None,
            round_num: 0,
            state: ReviewState::SelfResponding,
            approval: None,
        }
    }

    /// Lets a human answer on the reviewer side, according to the review mode.
    #[must_use]
    pub fn with_human_reviewer(mut self, human: Arc<dyn HumanReviewer>) -> Self {
        self.human = Some(human);
        self
    }

    /// Performer side.
    pub const fn performer(&self) -> &ResultConverser<C> {
        &self.performer
    }

    /// Mutable performer side.
    pub fn performer_mut(&mut self) -> &mut ResultConverser<C> {
        &mut self.performer
    }

    /// Consumes the dialog, returning the performer side.
    pub fn into_performer(self) -> ResultConverser<C> {
        self.performer
    }

    /// Reviewer conversation.
    pub const fn reviewer(&self) -> &ConversationManager {
        &self.reviewer
    }

    /// Completed non-approving rounds.
    pub const fn round_num(&self) -> u32 {
        self.round_num
    }

    /// Current state.
    pub const fn state(&self) -> ReviewState {
        self.state
    }

    /// Runs cycles until the dialog terminates, then rewinds the performer
    /// conversation with the configured end-of-review policy.
    ///
    /// `request` is posted to the performer first when given; otherwise the
    /// dialog continues from the performer conversation as it stands.
    ///
    /// # Errors
    /// Returns an error if a conversation or an LLM call fails.
    pub async fn run_dialog(&mut self, request: Option<&str>) -> Result<CycleStatus> {
        if let Some(request) = request {
            self.performer.post_request(request)?;
        }
        let start = self.performer.request_index()?;
        self.round_num = 0;
        self.approval = None;

        loop {
            let status = self.run_one_cycle().await?;
            if !status.is_terminal() {
                continue;
            }
            self.state = ReviewState::Terminated;
            info!(
                "[{}] review ended with {status:?} after {} round(s)",
                self.performer.manager().name(),
                self.round_num
            );
            if status != CycleStatus::FailedCheckSelfResponse {
                self.performer.set_request_index(start);
                self.performer
                    .rewind_on_completion(self.config.rewind_after_end_of_review)?;
                self.fold_approval()?;
            }
            return Ok(status);
        }
    }

    /// Runs one performer response and, budget permitting, one review.
    ///
    /// # Errors
    /// Returns an error if a conversation or an LLM call fails.
    pub async fn run_one_cycle(&mut self) -> Result<CycleStatus> {
        self.state = ReviewState::SelfResponding;
        let report = self.performer.iterate_until_valid_response().await?;
        if !report.converged {
            self.state = ReviewState::Terminated;
            return Ok(CycleStatus::FailedCheckSelfResponse);
        }

        if self.round_num >= self.config.max_reviewing_rounds {
            self.reviewer.append_user(MAX_ROUNDS_ACKNOWLEDGEMENT, None)?;
            self.state = ReviewState::Terminated;
            return Ok(CycleStatus::MaxRoundsExceeded);
        }

        self.state = ReviewState::OtherReviewing;
        let fresh = self.performer.fresh_looking_last_response()?;
        self.reviewer.append_user(fresh.clone(), None)?;
        let (reply, approved) = self.obtain_review(&fresh).await?;

        if approved {
            self.approval = Some(reply);
            self.state = ReviewState::Terminated;
            return Ok(CycleStatus::ApprovedByOther);
        }

        let performer = self.performer.manager();
        performer.append_user(format!("{}\n\n{REVISION_REQUEST}", reply.trim_end()), None)?;
        let feedback_index = performer.len()? - 1;
        self.performer.set_request_index(feedback_index);
        self.round_num += 1;
        self.state = ReviewState::SelfResponding;
        debug!(
            "[{}] round {} not approved",
            self.performer.manager().name(),
            self.round_num
        );
        Ok(CycleStatus::NotApprovedByOther)
    }

    /// Posts the approving reply to the performer when configured to.
    ///
    /// Runs after the end-of-review rewind so the reply is not collapsed away.
    /// Nothing is posted once `DeleteAll` has removed the exchange.
    fn fold_approval(&mut self) -> Result<()> {
        let Some(approval) = self.approval.take() else {
            return Ok(());
        };
        if !self.config.fold_approval_into_performer
            || self.config.rewind_after_end_of_review == Rewind::DeleteAll
        {
            return Ok(());
        }
        self.performer.manager().append_user(approval, None)
    }

    /// Review mode in effect, falling back to LLM-only without a human.
    fn effective_mode(&self) -> HumanReviewMode {
        match (self.config.human_review_mode, &self.human) {
            (HumanReviewMode::LlmOnly, _) => HumanReviewMode::LlmOnly,
            (mode, Some(_)) => mode,
            (mode, None) => {
                warn!("Review mode {mode:?} requested without a human reviewer; using the LLM only");
                HumanReviewMode::LlmOnly
            }
        }
    }

    /// Obtains the reviewer's reply and whether it approves.
    async fn obtain_review(&mut self, performer_response: &str) -> Result<(String, bool)> {
        let mode = self.effective_mode();
        let Some(human) = self.human.as_ref().map(Arc::clone) else {
            return self.llm_review().await;
        };
        let phrase = self.config.termination_phrase.clone();

        match mode {
            HumanReviewMode::LlmOnly => self.llm_review().await,
            HumanReviewMode::LlmThenHuman => {
                let (suggestion, llm_approved) = self.llm_review().await?;
                let answer = human
                    .review(&self.human_request(performer_response, Some(suggestion.clone())))
                    .await?;
                match classify_human_feedback(mode, &answer, &phrase) {
                    HumanDecision::AcceptLlm | HumanDecision::DeferToLlm => {
                        Ok((suggestion, llm_approved))
                    }
                    HumanDecision::Approve => Ok((answer, true)),
                    HumanDecision::Feedback(text) => {
                        self.reviewer.replace_last_response(&text)?;
                        let approved = classify_reviewer_reply(&text, &phrase) == Some(true);
                        Ok((text, approved))
                    }
                }
            }
            HumanReviewMode::HumanWithLlmUponRequest => {
                let answer = human
                    .review(&self.human_request(performer_response, None))
                    .await?;
                match classify_human_feedback(mode, &answer, &phrase) {
                    HumanDecision::Approve => {
                        self.reviewer.append_assistant(phrase.clone(), None)?;
                        Ok((phrase, true))
                    }
                    HumanDecision::DeferToLlm | HumanDecision::AcceptLlm => {
                        self.llm_review().await
                    }
                    HumanDecision::Feedback(text) => {
                        self.reviewer.append_assistant(text.clone(), None)?;
                        Ok((text, false))
                    }
                }
            }
        }
    }

    fn human_request(
        &self,
        performer_response: &str,
        llm_suggestion: Option<String>,
    ) -> HumanReviewRequest {
        HumanReviewRequest {
            conversation: self.reviewer.name().to_owned(),
            performer_response: performer_response.to_owned(),
            llm_suggestion,
        }
    }

    /// Asks the LLM reviewer, re-querying ambiguous replies.
    ///
    /// Odd re-queries post a clarification request; even ones regenerate the
    /// reply. A reply still ambiguous after the attempt budget is treated as
    /// not approving.
    async fn llm_review(&mut self) -> Result<(String, bool)> {
        let phrase = self.config.termination_phrase.clone();
        let mut attempts = 0_u32;
        loop {
            let reply = self
                .reviewer
                .get_response(
                    self.reviewer_llm.as_ref(),
                    &mut self.reviewer_settings,
                    None,
                )
                .await?;
            if let Some(approved) = classify_reviewer_reply(&reply, &phrase) {
                return Ok((reply, approved));
            }

            attempts += 1;
            if attempts >= self.config.max_reviewer_attempts {
                warn!(
                    "[{}] reviewer reply still ambiguous after {attempts} attempt(s)",
                    self.reviewer.name()
                );
                return Ok((reply, false));
            }
            if attempts % 2 == 1 {
                debug!("[{}] ambiguous reply, asking for clarification", self.reviewer.name());
                self.reviewer.append_user(
                    format!(
                        "Your reply is ambiguous. If you have no further feedback, reply only \
                         with \"{phrase}\". Otherwise, list your remaining issues without \
                         writing \"{phrase}\"."
                    ),
                    None,
                )?;
            } else {
                debug!("[{}] ambiguous reply, regenerating", self.reviewer.name());
                let len = self.reviewer.len()?;
                self.reviewer.truncate(len - 1)?;
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
    use crate::converser::FencedBlockChecker;
    use paper_core::{ActionsAndConversations, ConverserConfig, Role};
    use paper_providers::ScriptedProvider;

    const PHRASE: &str = "I hereby approve";

    fn dual(
        performer_llm: &ScriptedProvider,
        reviewer_llm: &ScriptedProvider,
        config: ReviewConfig,
    ) -> DualConverser<FencedBlockChecker> {
        let registry = ActionsAndConversations::new();
        let performer = ConversationManager::new(registry.clone(), "performer").unwrap();
        performer.initialize("You write plans.").unwrap();
        let reviewer = ConversationManager::new(registry, "reviewer").unwrap();
        reviewer.initialize("You review plans.").unwrap();

        let converser = ResultConverser::new(
            performer,
            Arc::new(performer_llm.clone()),
            LlmSettings::default(),
            ConverserConfig::default(),
            FencedBlockChecker::new("plan"),
        );
        DualConverser::new(
            converser,
            reviewer,
            Arc::new(reviewer_llm.clone()),
            LlmSettings::default(),
            config,
        )
    }

    /// Tests reviewer reply classification including the bulleted-list override.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_classify_reviewer_reply() {
        assert_eq!(classify_reviewer_reply("I hereby approve the plan.", PHRASE), Some(true));
        assert_eq!(
            classify_reviewer_reply("- add a baseline\nOtherwise I hereby approve", PHRASE),
            None
        );
        assert_eq!(classify_reviewer_reply("- add a baseline", PHRASE), Some(false));
    }

    /// Tests that an approving reviewer ends the dialog in one round.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_approved_first_round() {
        let performer_llm = ScriptedProvider::new("performer").with_queued("```plan\nstep 1\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer").with_queued("I hereby approve");
        let mut dual = dual(&performer_llm, &reviewer_llm, ReviewConfig::default());

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(dual.state(), ReviewState::Terminated);
        assert_eq!(dual.round_num(), 0);

        let reviewer = dual.reviewer().conversation().unwrap();
        assert_eq!(reviewer.messages()[1].content, "```plan\nstep 1\n```");
        assert_eq!(dual.performer().valid_result().unwrap(), "step 1");
    }

    /// Tests that feedback reaches the performer and the revision is reviewed.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_feedback_then_approval() {
        let performer_llm = ScriptedProvider::new("performer")
            .with_queued_all(["```plan\nstep 1\n```", "```plan\nstep 1\nstep 2\n```"]);
        let reviewer_llm = ScriptedProvider::new("reviewer")
            .with_queued_all(["- add step 2", "I hereby approve"]);
        let mut dual = dual(&performer_llm, &reviewer_llm, ReviewConfig::default());

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(dual.round_num(), 1);
        assert_eq!(dual.performer().valid_result().unwrap(), "step 1\nstep 2");

        let second_request = performer_llm.call_history()[1].clone();
        let feedback = second_request.last_user_content().unwrap();
        assert!(feedback.starts_with("- add step 2"));
        assert!(feedback.ends_with(REVISION_REQUEST));

        // AsFresh collapses the dialog to the request and the final plan.
        let performer = dual.performer().manager().conversation().unwrap();
        assert_eq!(performer.len(), 3);
        assert_eq!(performer.messages()[2].content, "```plan\nstep 1\nstep 2\n```");
    }

    /// Tests that a folded approval survives the end-of-review collapse.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_folded_approval_survives_as_fresh_rewind() {
        let performer_llm = ScriptedProvider::new("performer")
            .with_queued_all(["```plan\nstep 1\n```", "```plan\nstep 1\nstep 2\n```"]);
        let reviewer_llm = ScriptedProvider::new("reviewer")
            .with_queued_all(["- add step 2", "Looks complete. I hereby approve"]);
        let config = ReviewConfig {
            fold_approval_into_performer: true,
            ..ReviewConfig::default()
        };
        let mut dual = dual(&performer_llm, &reviewer_llm, config);

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::ApprovedByOther);

        let performer = dual.performer().manager().conversation().unwrap();
        let contents: Vec<&str> = performer
            .messages()
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(
            contents,
            [
                "You write plans.",
                "Write a plan",
                "```plan\nstep 1\nstep 2\n```",
                "Looks complete. I hereby approve",
            ]
        );
        assert_eq!(performer.messages()[3].role, Role::User);
    }

    /// Tests that no approval is folded in once the exchange is deleted.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_folded_approval_skipped_after_delete_all() {
        let performer_llm = ScriptedProvider::new("performer").with_queued("```plan\nstep\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer").with_queued("I hereby approve");
        let config = ReviewConfig {
            fold_approval_into_performer: true,
            rewind_after_end_of_review: Rewind::DeleteAll,
            ..ReviewConfig::default()
        };
        let mut dual = dual(&performer_llm, &reviewer_llm, config);

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(dual.performer().manager().conversation().unwrap().len(), 1);
    }

    /// Tests that the round budget auto-approves exactly after K rounds.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_round_budget_respected() {
        let performer_llm =
            ScriptedProvider::new("performer").with_default_response("```plan\nsame\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer").with_default_response("- no");
        let config = ReviewConfig {
            max_reviewing_rounds: 2,
            rewind_after_end_of_review: Rewind::Accumulate,
            ..ReviewConfig::default()
        };
        let mut dual = dual(&performer_llm, &reviewer_llm, config);
        dual.performer_mut().post_request("Write a plan").unwrap();

        assert_eq!(dual.run_one_cycle().await.unwrap(), CycleStatus::NotApprovedByOther);
        assert_eq!(dual.round_num(), 1);
        assert_eq!(dual.run_one_cycle().await.unwrap(), CycleStatus::NotApprovedByOther);
        assert_eq!(dual.round_num(), 2);
        assert_eq!(dual.run_one_cycle().await.unwrap(), CycleStatus::MaxRoundsExceeded);
        assert_eq!(reviewer_llm.call_count(), 2);

        let reviewer = dual.reviewer().conversation().unwrap();
        assert_eq!(
            reviewer.last_message().map(|message| message.content.as_str()),
            Some(MAX_ROUNDS_ACKNOWLEDGEMENT)
        );
    }

    /// Tests that an ambiguous approval is re-queried instead of accepted.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_ambiguous_reply_is_requeried() {
        let performer_llm = ScriptedProvider::new("performer").with_queued("```plan\nstep\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer")
            .with_queued_all(["- minor nit\nI hereby approve", "I hereby approve"]);
        let mut dual = dual(&performer_llm, &reviewer_llm, ReviewConfig::default());

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(reviewer_llm.call_count(), 2);
        let clarification = reviewer_llm.call_history()[1].clone();
        assert!(clarification.last_user_content().unwrap().contains("ambiguous"));
    }

    /// Tests that a performer failure terminates the dialog without review.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_performer_failure() {
        let performer_llm = ScriptedProvider::new("performer").with_default_response("no block");
        let reviewer_llm = ScriptedProvider::new("reviewer");
        let mut dual = dual(&performer_llm, &reviewer_llm, ReviewConfig::default());

        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        assert_eq!(status, CycleStatus::FailedCheckSelfResponse);
        assert_eq!(reviewer_llm.call_count(), 0);
    }

    /// Tests that a human approving blank ends the review without the LLM.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_human_blank_approves() {
        let performer_llm = ScriptedProvider::new("performer").with_queued("```plan\nstep\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer");
        let config = ReviewConfig {
            human_review_mode: HumanReviewMode::HumanWithLlmUponRequest,
            ..ReviewConfig::default()
        };
        let (human, mut receiver) = ChannelHumanReviewer::new(1);
        let ui = tokio::spawn(async move {
            let pending = receiver.recv().await.unwrap();
            pending.reply.send(String::new()).unwrap();
        });

        let mut dual =
            dual(&performer_llm, &reviewer_llm, config).with_human_reviewer(Arc::new(human));
        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        ui.await.unwrap();

        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(reviewer_llm.call_count(), 0);
    }

    /// Tests that a human asking for the AI defers to the LLM reviewer.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_human_defers_to_llm() {
        let performer_llm = ScriptedProvider::new("performer").with_queued("```plan\nstep\n```");
        let reviewer_llm = ScriptedProvider::new("reviewer").with_queued("I hereby approve");
        let config = ReviewConfig {
            human_review_mode: HumanReviewMode::HumanWithLlmUponRequest,
            ..ReviewConfig::default()
        };
        let (human, mut receiver) = ChannelHumanReviewer::new(1);
        let ui = tokio::spawn(async move {
            let pending = receiver.recv().await.unwrap();
            pending.reply.send("AI".to_owned()).unwrap();
        });

        let mut dual =
            dual(&performer_llm, &reviewer_llm, config).with_human_reviewer(Arc::new(human));
        let status = dual.run_dialog(Some("Write a plan")).await.unwrap();
        ui.await.unwrap();

        assert_eq!(status, CycleStatus::ApprovedByOther);
        assert_eq!(reviewer_llm.call_count(), 1);
    }
}
