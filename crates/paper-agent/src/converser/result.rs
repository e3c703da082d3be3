//! Response validation loop with rewind-on-failure.

use core::result;
use std::sync::Arc;

use tracing::{debug, info, warn};

use paper_core::{
    BumpModel, ConversationManager, ConverserConfig, Error, LlmClient, LlmSettings, Result,
    Rewind,
};

use super::extract::looks_truncated;
use super::outcome::ValidationOutcome;

/// Best valid value produced so far.
///
/// Once set, the value is only ever replaced, never cleared.
#[derive(Debug, Clone)]
pub struct ValidResult<T> {
    /// Current value
    value: Option<T>,
    /// How many times the value was set
    updates: usize,
}

impl<T> Default for ValidResult<T> {
    fn default() -> Self {
        Self {
            value: None,
            updates: 0,
        }
    }
}

impl<T> ValidResult<T> {
    /// Creates an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
        self.updates += 1;
    }

    /// Current value, if any.
    pub const fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether a value was ever set.
    pub const fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// How many times the value was set.
    pub const fn updates(&self) -> usize {
        self.updates
    }

    /// Current value, or [`Error::FailedCreatingProduct`] naming `product`.
    ///
    /// # Errors
    /// Returns an error if no value was ever set.
    pub fn require(&self, product: &str) -> Result<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| Error::FailedCreatingProduct(product.to_owned()))
    }

    /// Consumes the result, returning the value or [`Error::FailedCreatingProduct`].
    ///
    /// # Errors
    /// Returns an error if no value was ever set.
    pub fn into_value(self, product: &str) -> Result<T> {
        self.value
            .ok_or_else(|| Error::FailedCreatingProduct(product.to_owned()))
    }
}

/// Turns a raw response into a validated value.
///
/// Extraction is syntactic (pull out a block of a given format); checking is
/// semantic and updates the valid result on success. A check may set the
/// valid result and still fail, leaving a best-effort value behind.
pub trait ResultChecker: Send {
    /// Validated value type
    type Value: Send;

    /// Extracts the relevant text from a response.
    ///
    /// # Errors
    /// Returns a [`ValidationOutcome`] describing the formatting problem.
    fn extract(&mut self, response: &str) -> result::Result<String, ValidationOutcome>;

    /// Validates extracted text and updates the valid result.
    ///
    /// # Errors
    /// Returns a [`ValidationOutcome`] describing the content problem.
    fn check(
        &mut self,
        extracted: &str,
        valid_result: &mut ValidResult<Self::Value>,
    ) -> result::Result<(), ValidationOutcome>;

    /// Clean reconstruction of a response, as if it were the first answer.
    #[expect(unused_variables, reason = "The default keeps the response as is")]
    fn fresh_looking_response(&self, response: &str, extracted: Option<&str>) -> String {
        response.to_owned()
    }
}

/// Outcome of a validation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Whether the last response passed every check
    pub converged: bool,
    /// Whether a valid result exists, possibly from an earlier response
    pub has_result: bool,
    /// Responses consumed
    pub iterations: u32,
    /// Effective budget after iteration adjustments
    pub budget: i64,
}

/// Requests responses until one passes extraction and validation.
pub struct ResultConverser<C: ResultChecker> {
    /// Conversation being driven
    manager: ConversationManager,
    /// LLM service
    llm: Arc<dyn LlmClient>,
    /// Sampling settings, bumped on escalation
    settings: LlmSettings,
    /// Iteration budget and default rewind
    config: ConverserConfig,
    /// Extraction and validation strategy
    checker: C,
    /// Best value so far
    valid_result: ValidResult<C::Value>,
    /// Index of the request the responses answer
    request_index: Option<usize>,
    /// Current iteration, 1-based; 0 outside the loop
    iteration: u32,
    /// Text extracted from the last checked response
    last_extracted: Option<String>,
    /// Whether an `AsFreshCorrection` exchange is pending collapse
    correcting: bool,
    /// Tag attached to assistant responses
    response_tag: Option<String>,
}

impl<C: ResultChecker> ResultConverser<C> {
    /// Creates a converser over an existing conversation.
    pub fn new(
        manager: ConversationManager,
        llm: Arc<dyn LlmClient>,
        settings: LlmSettings,
        config: ConverserConfig,
        checker: C,
    ) -> Self {
        Self {
            manager,
            llm,
            settings,
            config,
            checker,
            valid_result: ValidResult::new(),
            request_index: None,
            iteration: 0,
            last_extracted: None,
            correcting: false,
            response_tag: None,
        }
    }

    /// Tags every assistant response.
    #[must_use]
    pub fn with_response_tag(mut self, tag: impl Into<String>) -> Self {
        self.response_tag = Some(tag.into());
        self
    }

    /// Conversation being driven.
    pub const fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    /// Current sampling settings.
    pub const fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Extraction and validation strategy.
    pub const fn checker(&self) -> &C {
        &self.checker
    }

    /// Mutable access to the strategy.
    pub fn checker_mut(&mut self) -> &mut C {
        &mut self.checker
    }

    /// Posts the request the responses will answer.
    ///
    /// # Errors
    /// Returns an error if the message cannot be appended.
    pub fn post_request(&mut self, request: &str) -> Result<()> {
        let index = self.manager.len()?;
        self.manager.append_user(request, None)?;
        self.request_index = Some(index);
        self.correcting = false;
        Ok(())
    }

    /// Posts a request and iterates until a valid response.
    ///
    /// # Errors
    /// Returns an error if the conversation or the LLM service fails.
    pub async fn run(&mut self, request: &str) -> Result<ConvergenceReport> {
        self.post_request(request)?;
        self.iterate_until_valid_response().await
    }

    /// Treats the message at `index` as the request later responses answer.
    pub fn set_request_index(&mut self, index: usize) {
        self.request_index = Some(index);
        self.correcting = false;
    }

    /// Index of the request, inferred from the conversation if none was posted.
    ///
    /// # Errors
    /// Returns an error if the conversation no longer exists.
    pub fn request_index(&mut self) -> Result<usize> {
        if let Some(index) = self.request_index {
            return Ok(index);
        }
        let len = self.manager.len()?;
        let offset = if self.manager.ends_with_response()? { 2 } else { 1 };
        let index = len.saturating_sub(offset).max(1);
        self.request_index = Some(index);
        Ok(index)
    }

    /// Requests responses until one is valid or the budget is spent.
    ///
    /// On the first iteration a response already ending the conversation is
    /// checked instead of requesting a new one.
    ///
    /// # Errors
    /// Returns an error if the conversation or the LLM service fails.
    pub async fn iterate_until_valid_response(&mut self) -> Result<ConvergenceReport> {
        let request_index = self.request_index()?;
        let mut budget = i64::from(self.config.max_valid_response_iterations);
        let mut used = 0_u32;

        while i64::from(used) < budget {
            used += 1;
            self.iteration = used;

            let reuse = used == 1
                && self.manager.ends_with_response()?
                && self.manager.len()? > request_index + 1;
            let response = if reuse {
                debug!("[{}] checking existing response", self.manager.name());
                self.manager.last_response()?.content
            } else {
                self.manager
                    .get_response(
                        self.llm.as_ref(),
                        &mut self.settings,
                        self.response_tag.as_deref(),
                    )
                    .await?
            };

            match self.check_response(&response) {
                Ok(()) => {
                    if self.correcting {
                        self.collapse_to_fresh(request_index, &response)?;
                        self.correcting = false;
                    }
                    info!(
                        "[{}] valid response after {used} iteration(s)",
                        self.manager.name()
                    );
                    self.iteration = 0;
                    return Ok(ConvergenceReport {
                        converged: true,
                        has_result: self.valid_result.is_set(),
                        iterations: used,
                        budget,
                    });
                }
                Err(outcome) => {
                    budget += i64::from(outcome.add_iterations);
                    self.apply_failure(request_index, &response, &outcome)?;
                }
            }
        }

        warn!(
            "[{}] no valid response within {budget} iteration(s)",
            self.manager.name()
        );
        self.iteration = 0;
        Ok(ConvergenceReport {
            converged: false,
            has_result: self.valid_result.is_set(),
            iterations: used,
            budget,
        })
    }

    /// Runs extraction then validation on a response.
    ///
    /// Fills in the recovery policy the checker left open: extraction
    /// failures accumulate on the first try and regenerate afterwards,
    /// bumping the context window when the response looks cut off; content
    /// failures use the configured default rewind.
    ///
    /// # Errors
    /// Returns the [`ValidationOutcome`] of the first failing stage.
    pub fn check_response(&mut self, response: &str) -> result::Result<(), ValidationOutcome> {
        self.last_extracted = None;
        let extracted = match self.checker.extract(response) {
            Ok(extracted) => extracted,
            Err(mut outcome) => {
                outcome.rewind.get_or_insert(if self.iteration <= 1 {
                    Rewind::Accumulate
                } else {
                    Rewind::Regenerate
                });
                outcome.bump_model.get_or_insert(if looks_truncated(response) {
                    BumpModel::HigherContext
                } else {
                    BumpModel::DoNotBump
                });
                return Err(outcome);
            }
        };
        self.last_extracted = Some(extracted.clone());

        let default_rewind = self.config.default_rewind_for_result_error;
        self.checker
            .check(&extracted, &mut self.valid_result)
            .map_err(|mut outcome| {
                outcome.rewind.get_or_insert(default_rewind);
                outcome.bump_model.get_or_insert(BumpModel::DoNotBump);
                outcome
            })
    }

    /// Applies the recovery policy of a failed response.
    fn apply_failure(
        &mut self,
        request_index: usize,
        response: &str,
        outcome: &ValidationOutcome,
    ) -> Result<()> {
        if let Some(bump) = outcome.bump_model {
            self.settings.bump(bump);
        }
        let rewind = outcome
            .rewind
            .unwrap_or(self.config.default_rewind_for_result_error);
        info!(
            "[{}] response rejected ({}), rewind {rewind:?}",
            self.manager.name(),
            outcome.title
        );

        match rewind {
            Rewind::Regenerate => {
                if self.manager.ends_with_response()? {
                    let len = self.manager.len()?;
                    self.manager.truncate(len - 1)?;
                }
            }
            Rewind::Restart | Rewind::DeleteAll => {
                self.manager.truncate(request_index + 1)?;
            }
            Rewind::Accumulate => {
                if outcome.rewrite_as_fresh {
                    let fresh = self.fresh(response);
                    self.manager.replace_last_response(&fresh)?;
                }
                self.manager.append_user(outcome.feedback_message(), None)?;
            }
            Rewind::AsFresh | Rewind::AsFreshCorrection => {
                let fresh = self.fresh(response);
                self.manager.truncate(request_index + 1)?;
                self.manager
                    .append_assistant(fresh, self.response_tag.as_deref())?;
                self.manager.append_user(outcome.feedback_message(), None)?;
                self.correcting = rewind == Rewind::AsFreshCorrection;
            }
        }
        Ok(())
    }

    /// Fresh-looking form of a response.
    fn fresh(&self, response: &str) -> String {
        self.checker
            .fresh_looking_response(response, self.last_extracted.as_deref())
    }

    /// Fresh-looking form of the last response.
    ///
    /// # Errors
    /// Returns [`Error::NoResponse`] if there is no response yet.
    pub fn fresh_looking_last_response(&self) -> Result<String> {
        let last = self.manager.last_response()?;
        Ok(self.fresh(&last.content))
    }

    /// Replaces everything after the request with the fresh form of `response`.
    fn collapse_to_fresh(&self, request_index: usize, response: &str) -> Result<()> {
        let fresh = self.fresh(response);
        self.manager.truncate(request_index + 1)?;
        self.manager
            .append_assistant(fresh, self.response_tag.as_deref())
    }

    /// Rewrites the exchange once the caller is done with it.
    ///
    /// `Accumulate` and `Regenerate` keep the history; `AsFresh` keeps the
    /// request and the fresh-looking last response; `Restart` keeps only the
    /// request; `DeleteAll` removes the request too.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be rewritten.
    pub fn rewind_on_completion(&mut self, rewind: Rewind) -> Result<()> {
        let request_index = self.request_index()?;
        debug!(
            "[{}] rewinding completed exchange with {rewind:?}",
            self.manager.name()
        );
        match rewind {
            Rewind::Accumulate | Rewind::Regenerate => Ok(()),
            Rewind::AsFresh | Rewind::AsFreshCorrection => {
                let last = self.manager.last_response()?;
                self.collapse_to_fresh(request_index, &last.content)
            }
            Rewind::Restart => self.manager.truncate(request_index + 1).map(|_| ()),
            Rewind::DeleteAll => {
                self.request_index = None;
                self.manager.truncate(request_index).map(|_| ())
            }
        }
    }

    /// Best value so far.
    ///
    /// # Errors
    /// Returns [`Error::FailedCreatingProduct`] if no response was ever valid.
    pub fn valid_result(&self) -> Result<&C::Value> {
        self.valid_result.require(self.manager.name())
    }

    /// Consumes the converser, returning the best value.
    ///
    /// # Errors
    /// Returns [`Error::FailedCreatingProduct`] if no response was ever valid.
    pub fn into_valid_result(self) -> Result<C::Value> {
        self.valid_result.into_value(self.manager.name())
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
    use paper_core::{ActionsAndConversations, Role};
    use paper_providers::ScriptedProvider;

    /// Accepts responses of the form `value: <n>` with an even `n`.
    struct EvenNumber;

    impl ResultChecker for EvenNumber {
        type Value = i64;

        fn extract(&mut self, response: &str) -> result::Result<String, ValidationOutcome> {
            response
                .strip_prefix("value: ")
                .map(str::to_owned)
                .ok_or_else(|| ValidationOutcome::new("Format", "Start with `value: `."))
        }

        fn check(
            &mut self,
            extracted: &str,
            valid_result: &mut ValidResult<i64>,
        ) -> result::Result<(), ValidationOutcome> {
            let number: i64 = extracted
                .trim()
                .parse()
                .map_err(|_| ValidationOutcome::new("Not a number", extracted.to_owned()))?;
            if number % 2 != 0 {
                return Err(ValidationOutcome::new("Odd", "The number must be even."));
            }
            valid_result.set(number);
            Ok(())
        }

        fn fresh_looking_response(&self, _response: &str, extracted: Option<&str>) -> String {
            format!("value: {}", extracted.unwrap_or("?").trim())
        }
    }

    fn converser(responses: &[&str], config: ConverserConfig) -> ResultConverser<EvenNumber> {
        let manager = ConversationManager::new(ActionsAndConversations::new(), "numbers").unwrap();
        manager.initialize("You answer with numbers.").unwrap();
        let llm = ScriptedProvider::new("numbers").with_queued_all(responses.iter().copied());
        ResultConverser::new(manager, Arc::new(llm), LlmSettings::default(), config, EvenNumber)
    }

    fn contents(converser: &ResultConverser<EvenNumber>) -> Vec<String> {
        converser
            .manager()
            .conversation()
            .unwrap()
            .iter()
            .map(|message| message.content.clone())
            .collect()
    }

    /// Tests that a valid first response converges in one iteration.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_converges_on_first_valid_response() {
        let mut converser = converser(&["value: 4"], ConverserConfig::default());
        let report = converser.run("Give me an even number").await.unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 1);
        assert_eq!(*converser.valid_result().unwrap(), 4);
        assert_eq!(converser.manager().len().unwrap(), 3);
    }

    /// Tests that a formatting failure accumulates first and regenerates afterwards.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_extraction_failure_accumulates_then_regenerates() {
        let mut converser = converser(
            &["four", "still four", "value: 4"],
            ConverserConfig::default(),
        );
        let report = converser.run("Give me an even number").await.unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 3);

        let contents = contents(&converser);
        assert_eq!(contents.len(), 5);
        assert_eq!(contents[2], "four");
        assert!(contents[3].starts_with("# Format"));
        assert_eq!(contents[4], "value: 4");
    }

    /// Tests that a content failure reposts the response as fresh with feedback.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_semantic_failure_rewinds_as_fresh() {
        let mut converser = converser(&["value: 3", "value: 6"], ConverserConfig::default());
        converser.run("Give me an even number").await.unwrap();

        let conversation = converser.manager().conversation().unwrap();
        let roles: Vec<Role> = conversation.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(conversation.messages()[2].content, "value: 3");
        assert!(conversation.messages()[3].content.starts_with("# Odd"));
    }

    /// Tests that an accepted correction replaces the correction exchange.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_as_fresh_correction_collapses_on_success() {
        let config = ConverserConfig {
            default_rewind_for_result_error: Rewind::AsFreshCorrection,
            ..ConverserConfig::default()
        };
        let mut converser = converser(&["value: 3", "value: 8"], config);
        converser.run("Give me an even number").await.unwrap();

        let contents = contents(&converser);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[2], "value: 8");
    }

    /// Tests that negative iteration adjustments shrink the budget.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_add_iterations_adjusts_budget() {
        struct Stubborn;

        impl ResultChecker for Stubborn {
            type Value = ();

            fn extract(&mut self, response: &str) -> result::Result<String, ValidationOutcome> {
                Ok(response.to_owned())
            }

            fn check(
                &mut self,
                _extracted: &str,
                _valid_result: &mut ValidResult<()>,
            ) -> result::Result<(), ValidationOutcome> {
                Err(ValidationOutcome::new("No", "Never good enough.").with_add_iterations(-1))
            }
        }

        let manager = ConversationManager::new(ActionsAndConversations::new(), "stubborn").unwrap();
        manager.initialize("sys").unwrap();
        let llm = ScriptedProvider::new("stubborn").with_default_response("anything");
        let mut converser = ResultConverser::new(
            manager,
            Arc::new(llm.clone()),
            LlmSettings::default(),
            ConverserConfig::default(),
            Stubborn,
        );
        let report = converser.run("Try").await.unwrap();
        assert!(!report.converged);
        // Budget 4 loses one per failure: 4, 3, 2 -> stops after two responses.
        assert_eq!(report.iterations, 2);
        assert_eq!(report.budget, 2);
        assert_eq!(llm.call_count(), 2);
    }

    /// Tests that extra iterations granted on the last attempt are honored.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_add_iterations_on_last_attempt_extends_loop() {
        /// Rejects everything, granting two more tries on the `grant_on`th check.
        struct LateGrant {
            checks: u32,
            grant_on: u32,
        }

        impl ResultChecker for LateGrant {
            type Value = ();

            fn extract(&mut self, response: &str) -> result::Result<String, ValidationOutcome> {
                Ok(response.to_owned())
            }

            fn check(
                &mut self,
                _extracted: &str,
                _valid_result: &mut ValidResult<()>,
            ) -> result::Result<(), ValidationOutcome> {
                self.checks += 1;
                let outcome = ValidationOutcome::new("No", "Still wrong.");
                if self.checks == self.grant_on {
                    return Err(outcome.with_add_iterations(2));
                }
                Err(outcome)
            }
        }

        let config = ConverserConfig {
            max_valid_response_iterations: 3,
            ..ConverserConfig::default()
        };
        let manager = ConversationManager::new(ActionsAndConversations::new(), "late").unwrap();
        manager.initialize("sys").unwrap();
        let llm = ScriptedProvider::new("late").with_default_response("anything");
        let mut converser = ResultConverser::new(
            manager,
            Arc::new(llm.clone()),
            LlmSettings::default(),
            config,
            LateGrant {
                checks: 0,
                grant_on: 3,
            },
        );
        let report = converser.run("Try").await.unwrap();

        assert!(!report.converged);
        assert_eq!(report.budget, 5);
        assert_eq!(report.iterations, 5);
        assert_eq!(llm.call_count(), 5);
        assert_eq!(converser.checker().checks, 5);
        assert!(matches!(
            converser.valid_result(),
            Err(Error::FailedCreatingProduct(_))
        ));
    }

    /// Tests that exhausting the budget without a value fails the product.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_exhaustion_without_result_fails_product() {
        let config = ConverserConfig {
            max_valid_response_iterations: 2,
            ..ConverserConfig::default()
        };
        let mut converser = converser(&["value: 1", "value: 3"], config);
        let report = converser.run("Give me an even number").await.unwrap();
        assert!(!report.converged);
        assert!(!report.has_result);
        assert!(matches!(
            converser.valid_result(),
            Err(Error::FailedCreatingProduct(_))
        ));
    }

    /// Tests that an existing final response is checked without a new request.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_reuses_existing_response() {
        let manager = ConversationManager::new(ActionsAndConversations::new(), "numbers").unwrap();
        manager.initialize("sys").unwrap();
        manager.append_user("Give me an even number", None).unwrap();
        manager.append_assistant("value: 10", None).unwrap();
        let llm = ScriptedProvider::new("numbers");
        let mut converser = ResultConverser::new(
            manager,
            Arc::new(llm.clone()),
            LlmSettings::default(),
            ConverserConfig::default(),
            EvenNumber,
        );

        let first = converser.iterate_until_valid_response().await.unwrap();
        let second = converser.iterate_until_valid_response().await.unwrap();
        assert!(first.converged && second.converged);
        assert_eq!(llm.call_count(), 0);
        assert_eq!(*converser.valid_result().unwrap(), 10);
    }

    /// Tests that `DeleteAll` removes the request and keeps the value.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_rewind_on_completion_delete_all() {
        let mut converser = converser(&["value: 2"], ConverserConfig::default());
        converser.run("Give me an even number").await.unwrap();
        converser.rewind_on_completion(Rewind::DeleteAll).unwrap();
        assert_eq!(converser.manager().len().unwrap(), 1);
        assert_eq!(*converser.valid_result().unwrap(), 2);
    }
}
