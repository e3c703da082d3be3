//! Code repair state machine.
//!
//! Each submission is extracted, checked and run; the most severe problem
//! found, together with how many submissions preceded it, selects a repair
//! action from a fixed table. Reposting replaces the noisy back-and-forth with
//! a clean history in which the current code looks like a first answer.

use std::iter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use paper_core::{
    BumpModel, CodeAndOutput, ConversationManager, DebuggerConfig, LlmClient, LlmSettings,
    Result,
};

use super::issues::{CodeProblem, RunIssue, RunIssues};
use super::requirements::OutputFileRequirements;
use super::sandbox::{CodeExecutor, RunOutcome, RunRequest};
use super::static_checks::{CodeRules, check_small_change, run_static_checks};
use crate::converser::{CodeBlockError, extract_code_block};

/// How the conversation is repaired after a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Truncate back to after the N-th submission's feedback and request again
    Regenerate(usize),
    /// Truncate back to after the N-th submission's feedback and repost the
    /// current code as the next answer
    Repost(usize),
    /// Keep the exchange and post feedback
    Leave,
}

/// A table cell: a fixed action, or a choice depending on progress.
#[derive(Debug, Clone, Copy)]
enum Cell {
    /// Always this action
    Always(RepairAction),
    /// The first action if the problem is at least as far along as the
    /// previous one, else the second
    UnlessRegressed(RepairAction, RepairAction),
}

use Cell::{Always, UnlessRegressed};
use RepairAction::{Leave, Regenerate, Repost};

/// Rows by [`CodeProblem::stage_row`], columns by prior submissions (0, 1, 2+).
const REPAIR_TABLE: [[Cell; 3]; 6] = [
    // IncompleteBlock
    [
        Always(Regenerate(0)),
        Always(Regenerate(1)),
        Always(Regenerate(1)),
    ],
    // NotSingleBlock
    [Always(Leave), Always(Regenerate(1)), Always(Regenerate(2))],
    // StaticCheck
    [
        Always(Repost(0)),
        UnlessRegressed(Repost(0), Regenerate(1)),
        Always(Regenerate(2)),
    ],
    // RuntimeError
    [
        Always(Repost(0)),
        UnlessRegressed(Repost(0), Leave),
        Always(Repost(1)),
    ],
    // MissingOutputFiles, OutputFileAnnotation
    [
        Always(Repost(0)),
        UnlessRegressed(Repost(0), Leave),
        UnlessRegressed(Repost(0), Regenerate(1)),
    ],
    // AllOk
    [Always(Repost(0)), Always(Repost(0)), Always(Repost(0))],
];

/// Selects the repair action for a problem.
///
/// `response_count` is the number of submissions before the current one;
/// counts above two use the last column.
pub fn select_repair_action(
    problem: CodeProblem,
    response_count: usize,
    previous: Option<CodeProblem>,
) -> RepairAction {
    let column = response_count.min(2);
    match REPAIR_TABLE[problem.stage_row()][column] {
        Always(action) => action,
        UnlessRegressed(progressed, regressed) => {
            let made_progress = previous
                .is_none_or(|previous| problem.stage_row() >= previous.stage_row());
            if made_progress { progressed } else { regressed }
        }
    }
}

/// One repair decision, kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairRecord {
    /// Debug iteration, 1-based
    pub iteration: u32,
    /// Most severe problem of the submission
    pub problem: CodeProblem,
    /// Submissions before this one, capped at two
    pub response_count: usize,
    /// Action taken
    pub action: RepairAction,
}

/// Result of evaluating one submission.
struct Evaluation {
    /// Extracted code, if any
    code: Option<String>,
    /// Problems found
    issues: RunIssues,
    /// Accepted artifact, when there are no problems
    accepted: Option<CodeAndOutput>,
}

/// Requests code until it runs cleanly and produces the required outputs.
pub struct Debugger {
    /// Conversation the code is written in
    manager: ConversationManager,
    /// LLM writing the code
    llm: Arc<dyn LlmClient>,
    /// Sampling settings, bumped on truncated responses
    settings: LlmSettings,
    /// Sandbox running the code
    executor: Arc<dyn CodeExecutor>,
    /// Iteration budget, timeout and limits
    config: DebuggerConfig,
    /// Directory holding the data files
    run_folder: PathBuf,
    /// Files the code may read
    data_files: Vec<String>,
    /// Files the code may and must create
    output_requirements: OutputFileRequirements,
    /// Import, function and content rules
    rules: CodeRules,
    /// Code a small change was requested on
    previous_code: Option<String>,
    /// Problem of the previous submission
    previous_problem: Option<CodeProblem>,
    /// Conversation length before the request
    conversation_len_before_first_response: usize,
    /// Every repair decision of the current session
    repair_log: Vec<RepairRecord>,
}

impl Debugger {
    /// Creates a debugger writing code in `manager`'s conversation.
    pub fn new(
        manager: ConversationManager,
        llm: Arc<dyn LlmClient>,
        settings: LlmSettings,
        executor: Arc<dyn CodeExecutor>,
        config: DebuggerConfig,
    ) -> Self {
        Self {
            manager,
            llm,
            settings,
            executor,
            config,
            run_folder: PathBuf::from("."),
            data_files: Vec::new(),
            output_requirements: OutputFileRequirements::new(),
            rules: CodeRules::default(),
            previous_code: None,
            previous_problem: None,
            conversation_len_before_first_response: 0,
            repair_log: Vec::new(),
        }
    }

    /// Runs code in `folder`.
    #[must_use]
    pub fn with_run_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.run_folder = folder.into();
        self
    }

    /// Allows reading these data files.
    #[must_use]
    pub fn with_data_files(mut self, files: Vec<String>) -> Self {
        self.data_files = files;
        self
    }

    /// Sets the required output files.
    #[must_use]
    pub fn with_output_requirements(mut self, requirements: OutputFileRequirements) -> Self {
        self.output_requirements = requirements;
        self
    }

    /// Sets the code rules.
    #[must_use]
    pub fn with_rules(mut self, rules: CodeRules) -> Self {
        self.rules = rules;
        self
    }

    /// Flags submissions that drop too much of `previous_code`.
    #[must_use]
    pub fn requesting_small_change(mut self, previous_code: impl Into<String>) -> Self {
        self.previous_code = Some(previous_code.into());
        self
    }

    /// Conversation the code is written in.
    pub const fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    /// Current sampling settings.
    pub const fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Repair decisions of the last session.
    pub fn repair_log(&self) -> &[RepairRecord] {
        &self.repair_log
    }

    /// Conversation length before the last request was posted.
    pub const fn conversation_len_before_first_response(&self) -> usize {
        self.conversation_len_before_first_response
    }

    /// Posts `request` and debugs until the code is accepted.
    ///
    /// Returns `None` when the iteration budget runs out; the conversation is
    /// then truncated to its length before the request.
    ///
    /// # Errors
    /// Returns an error if the conversation, the LLM or the sandbox fails.
    pub async fn run_debugging(&mut self, request: &str) -> Result<Option<CodeAndOutput>> {
        let before = self.manager.len()?;
        self.conversation_len_before_first_response = before;
        self.previous_problem = None;
        self.repair_log.clear();
        self.manager.append_user(request, None)?;

        for iteration in 1..=self.config.max_debug_iterations {
            let response = self
                .manager
                .get_response(self.llm.as_ref(), &mut self.settings, None)
                .await?;
            let evaluation = self.evaluate(&response).await?;
            let problem = evaluation.issues.problem();
            let response_count = ((self.manager.len()? - before - 2) / 2).min(2);
            let action = select_repair_action(problem, response_count, self.previous_problem);
            info!(
                "[{}] debug iteration {iteration}: {problem:?} after {response_count} submission(s), {action:?}",
                self.manager.name()
            );
            self.repair_log.push(RepairRecord {
                iteration,
                problem,
                response_count,
                action,
            });

            if problem == CodeProblem::IncompleteBlock {
                self.settings.bump(BumpModel::HigherContext);
            }
            self.apply_repair(action, before, evaluation.code.as_deref(), &evaluation.issues)?;
            self.previous_problem = Some(problem);

            if let Some(accepted) = evaluation.accepted {
                return Ok(Some(accepted));
            }
        }

        warn!(
            "[{}] code not accepted after {} iteration(s); restarting from scratch",
            self.manager.name(),
            self.config.max_debug_iterations
        );
        self.manager
            .comment("Debugging did not converge. Let's restart from scratch.")?;
        self.manager.truncate(before)?;
        Ok(None)
    }

    /// Extracts, checks and runs one submission.
    async fn evaluate(&self, response: &str) -> Result<Evaluation> {
        let code = match extract_code_block(response, "python") {
            Ok(code) => code,
            Err(error) => {
                return Ok(Evaluation {
                    code: None,
                    issues: iter::once(block_issue(error)).collect(),
                    accepted: None,
                });
            }
        };

        let mut issues = run_static_checks(&code, &self.rules);
        if let Some(previous) = &self.previous_code {
            issues.extend(check_small_change(
                &code,
                previous,
                self.config.small_change_min_ratio,
            ));
        }
        if !issues.is_empty() {
            return Ok(Evaluation {
                code: Some(code),
                issues,
                accepted: None,
            });
        }

        let request = RunRequest {
            code: code.clone(),
            run_folder: self.run_folder.clone(),
            allowed_read_files: self.data_files.clone(),
            output_requirements: self.output_requirements.clone(),
            rules: self.rules.clone(),
            timeout: Duration::from_secs(self.config.timeout_sec),
        };
        let outcome = self.executor.run(&request).await?;
        match &outcome.failure {
            Some(failure) => {
                issues.push(failure.to_issue(&request, self.config.max_traceback_chars));
            }
            None => issues = self.output_requirements.check(&outcome.created_files),
        }

        if !issues.is_empty() {
            self.discard_outputs(&outcome).await;
            return Ok(Evaluation {
                code: Some(code),
                issues,
                accepted: None,
            });
        }

        let accepted = self.accept(&code, outcome);
        Ok(Evaluation {
            code: Some(code),
            issues,
            accepted: Some(accepted),
        })
    }

    /// Builds the artifact of an accepted run.
    fn accept(&self, code: &str, outcome: RunOutcome) -> CodeAndOutput {
        let requirements = &self.output_requirements;
        let created = outcome.created_files.keys().map(String::as_str);
        let output = requirements
            .primary_file(created.clone())
            .and_then(|file| outcome.created_files.get(file).cloned().flatten());
        CodeAndOutput {
            code: code.to_owned(),
            output,
            created_files: requirements.group(created),
            output_file_contents: outcome
                .created_files
                .iter()
                .filter_map(|(file, content)| {
                    content.as_ref().map(|content| (file.clone(), content.clone()))
                })
                .collect(),
            dataframe_operations: outcome.dataframe_operations,
            explanation: None,
        }
    }

    /// Removes files a rejected run created, so the next run starts clean.
    async fn discard_outputs(&self, outcome: &RunOutcome) {
        for file in outcome.created_files.keys() {
            if let Err(err) = fs::remove_file(self.run_folder.join(file)).await {
                debug!("Could not remove {file} after a rejected run: {err}");
            }
        }
    }

    /// Rewrites the conversation according to `action`.
    fn apply_repair(
        &self,
        action: RepairAction,
        before: usize,
        code: Option<&str>,
        issues: &RunIssues,
    ) -> Result<()> {
        match (action, code) {
            (RepairAction::Regenerate(submissions), _) => {
                self.manager.truncate(before + 1 + 2 * submissions)?;
            }
            (RepairAction::Repost(submissions), Some(code)) => {
                self.manager.truncate(before + 1 + 2 * submissions)?;
                self.manager
                    .append_assistant(fresh_code_response(code), None)?;
                self.post_feedback(issues)?;
            }
            (RepairAction::Repost(_) | RepairAction::Leave, _) => self.post_feedback(issues)?,
        }
        Ok(())
    }

    fn post_feedback(&self, issues: &RunIssues) -> Result<()> {
        if issues.is_empty() {
            return Ok(());
        }
        self.manager.append_user(
            format!(
                "{}\n\nPlease rewrite the complete code, fixing these issues, in a single \
                 ```python block.",
                issues.feedback_message()
            ),
            None,
        )
    }
}

/// Code posted as if it were the model's first answer.
pub fn fresh_code_response(code: &str) -> String {
    format!("Here is the code to perform the requested analysis:\n```python\n{}\n```", code.trim_end())
}

fn block_issue(error: CodeBlockError) -> RunIssue {
    match error {
        CodeBlockError::Incomplete => RunIssue::new(
            "Code block",
            "Your code block is incomplete; the response was cut off.",
            CodeProblem::IncompleteBlock,
        )
        .with_instructions("Please send the complete code, keeping it concise."),
        CodeBlockError::NoBlock => RunIssue::new(
            "Code block",
            "Your response does not contain a code block.",
            CodeProblem::NotSingleBlock,
        )
        .with_instructions("Please send the complete code in a single ```python block."),
        CodeBlockError::MultipleBlocks(count) => RunIssue::new(
            "Code block",
            format!("Your response contains {count} code blocks."),
            CodeProblem::NotSingleBlock,
        )
        .with_instructions("Please send the complete code in a single ```python block."),
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

    /// Tests every fixed cell of the repair table.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_fixed_cells() {
        let cases = [
            (CodeProblem::IncompleteBlock, 0, Regenerate(0)),
            (CodeProblem::IncompleteBlock, 1, Regenerate(1)),
            (CodeProblem::IncompleteBlock, 2, Regenerate(1)),
            (CodeProblem::NotSingleBlock, 0, Leave),
            (CodeProblem::NotSingleBlock, 1, Regenerate(1)),
            (CodeProblem::NotSingleBlock, 2, Regenerate(2)),
            (CodeProblem::StaticCheck, 0, Repost(0)),
            (CodeProblem::StaticCheck, 2, Regenerate(2)),
            (CodeProblem::RuntimeError, 0, Repost(0)),
            (CodeProblem::RuntimeError, 2, Repost(1)),
            (CodeProblem::MissingOutputFiles, 0, Repost(0)),
            (CodeProblem::OutputFileAnnotation, 0, Repost(0)),
            (CodeProblem::AllOk, 0, Repost(0)),
            (CodeProblem::AllOk, 1, Repost(0)),
            (CodeProblem::AllOk, 2, Repost(0)),
        ];
        for (problem, count, expected) in cases {
            for previous in [None, Some(CodeProblem::IncompleteBlock), Some(CodeProblem::AllOk)] {
                assert_eq!(
                    select_repair_action(problem, count, previous),
                    expected,
                    "{problem:?} at {count} after {previous:?}"
                );
            }
        }
    }

    /// Tests the progress-dependent cells.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_progress_dependent_cells() {
        let progressed = Some(CodeProblem::IncompleteBlock);
        let same = Some(CodeProblem::RuntimeError);
        let regressed = Some(CodeProblem::AllOk);

        assert_eq!(select_repair_action(CodeProblem::StaticCheck, 1, progressed), Repost(0));
        assert_eq!(select_repair_action(CodeProblem::StaticCheck, 1, regressed), Regenerate(1));
        assert_eq!(select_repair_action(CodeProblem::RuntimeError, 1, same), Repost(0));
        assert_eq!(select_repair_action(CodeProblem::RuntimeError, 1, regressed), Leave);
        assert_eq!(select_repair_action(CodeProblem::MissingOutputFiles, 1, same), Repost(0));
        assert_eq!(select_repair_action(CodeProblem::MissingOutputFiles, 1, regressed), Leave);
        assert_eq!(select_repair_action(CodeProblem::MissingOutputFiles, 2, same), Repost(0));
        assert_eq!(
            select_repair_action(CodeProblem::OutputFileAnnotation, 2, regressed),
            Regenerate(1)
        );
        assert_eq!(select_repair_action(CodeProblem::RuntimeError, 7, None), Repost(1));
    }

    /// Tests the issue raised for each code block failure.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_block_issues() {
        assert_eq!(
            block_issue(CodeBlockError::Incomplete).code_problem,
            CodeProblem::IncompleteBlock
        );
        assert_eq!(
            block_issue(CodeBlockError::MultipleBlocks(2)).code_problem,
            CodeProblem::NotSingleBlock
        );
        assert!(fresh_code_response("x = 1\n").ends_with("```python\nx = 1\n```"));
    }
}
