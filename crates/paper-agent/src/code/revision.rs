//! Code step orchestration: write, review the output, revise, explain.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use paper_core::{
    CodeAndOutput, CodeStep, ConversationManager, Error, LlmClient, LlmSettings, PipelineConfig,
    ProductField, Result, Rewind,
};

use super::debugger::Debugger;
use super::requirements::OutputFileRequirements;
use super::sandbox::CodeExecutor;
use super::static_checks::CodeRules;
use crate::converser::{FencedBlockChecker, JsonObjectChecker, ResultChecker, ResultConverser};
use crate::prompts::render_prompt;

/// Drives one code step to an accepted [`CodeAndOutput`].
///
/// The code is written by up to `max_code_writing_attempts` debugging
/// sessions. Each review question is then asked about the output; any issue
/// leads to a small-change revision, up to `max_code_revisions` times.
/// Finally the code can be explained.
pub struct CodeRevisionOrchestrator {
    /// Step whose code is written
    step: CodeStep,
    /// Code-writing conversation
    manager: ConversationManager,
    /// LLM writing and reviewing the code
    llm: Arc<dyn LlmClient>,
    /// Initial sampling settings of every session
    settings: LlmSettings,
    /// Sandbox running the code
    executor: Arc<dyn CodeExecutor>,
    /// Budgets of all loops
    config: PipelineConfig,
    /// Directory holding the data files
    run_folder: PathBuf,
    /// Files the code may read
    data_files: Vec<String>,
    /// Files the code may and must create
    output_requirements: OutputFileRequirements,
    /// Code rules
    rules: CodeRules,
    /// What the code should achieve
    goal: String,
    /// Questions asked about the output of accepted code
    review_questions: Vec<String>,
    /// Language tag of the explanation block
    explanation_label: String,
}

impl CodeRevisionOrchestrator {
    /// Creates an orchestrator writing `step`'s code in `manager`'s conversation.
    pub fn new(
        step: CodeStep,
        manager: ConversationManager,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn CodeExecutor>,
        config: PipelineConfig,
    ) -> Self {
        let settings = LlmSettings {
            engine: config.llm.default_engine,
            temperature: config.llm.temperature,
            ..LlmSettings::default()
        };
        Self {
            step,
            manager,
            llm,
            settings,
            executor,
            config,
            run_folder: PathBuf::from("."),
            data_files: Vec::new(),
            output_requirements: OutputFileRequirements::new(),
            rules: CodeRules::default(),
            goal: String::new(),
            review_questions: Vec::new(),
            explanation_label: "markdown".to_owned(),
        }
    }

    /// Runs code in `folder`, which holds `data_files`.
    #[must_use]
    pub fn with_data(mut self, folder: impl Into<PathBuf>, data_files: Vec<String>) -> Self {
        self.run_folder = folder.into();
        self.data_files = data_files;
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

    /// Describes what the code should achieve.
    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    /// Adds a question asked about the output of accepted code.
    #[must_use]
    pub fn with_review_question(mut self, question: impl Into<String>) -> Self {
        self.review_questions.push(question.into());
        self
    }

    /// Returns the explanation in a block with this language tag.
    #[must_use]
    pub fn with_explanation_label(mut self, label: impl Into<String>) -> Self {
        self.explanation_label = label.into();
        self
    }

    /// Code-writing conversation.
    pub const fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    /// Writes, reviews, revises and explains the step's code.
    ///
    /// # Errors
    /// Returns [`Error::FailedCreatingProduct`] if no debugging session
    /// produced accepted code, or any conversation, LLM or sandbox error.
    pub async fn run(&self) -> Result<CodeAndOutput> {
        let mut accepted = self.write_code().await?;

        for revision in 1..=self.config.code.max_code_revisions {
            let issues = self.review_output(&accepted).await?;
            if issues.is_empty() {
                info!("[{}] output review found no issues", self.manager.name());
                break;
            }
            info!(
                "[{}] revision {revision}: {} output issue(s)",
                self.manager.name(),
                issues.len()
            );
            let request =
                render_prompt("code_revision", &[("issues", format_issues(&issues).as_str())])?;
            let mut debugger = self.debugger().requesting_small_change(accepted.code.clone());
            match debugger.run_debugging(&request).await? {
                Some(revised) => accepted = revised,
                None => {
                    warn!(
                        "[{}] revision {revision} failed; keeping the last accepted code",
                        self.manager.name()
                    );
                    break;
                }
            }
        }

        if self.config.code.explain_code {
            accepted.explanation = self.explain_code().await?;
        }
        Ok(accepted)
    }

    /// Runs debugging sessions until one produces accepted code.
    async fn write_code(&self) -> Result<CodeAndOutput> {
        let request = self.code_request()?;
        for attempt in 1..=self.config.code.max_code_writing_attempts {
            info!(
                "[{}] code writing attempt {attempt}/{}",
                self.manager.name(),
                self.config.code.max_code_writing_attempts
            );
            if let Some(accepted) = self.debugger().run_debugging(&request).await? {
                return Ok(accepted);
            }
        }
        Err(Error::FailedCreatingProduct(
            ProductField::Codes(self.step).to_string(),
        ))
    }

    fn code_request(&self) -> Result<String> {
        let data_files = self
            .data_files
            .iter()
            .map(|file| format!("\"{file}\""))
            .collect::<Vec<_>>()
            .join(", ");
        render_prompt(
            "code_request",
            &[
                ("step", self.step.title()),
                ("goal", self.goal.as_str()),
                ("data_files", data_files.as_str()),
                ("outputs", self.output_requirements.describe_allowed().as_str()),
            ],
        )
    }

    fn debugger(&self) -> Debugger {
        Debugger::new(
            self.manager.clone(),
            Arc::clone(&self.llm),
            self.settings.clone(),
            Arc::clone(&self.executor),
            self.config.debugger.clone(),
        )
        .with_run_folder(self.run_folder.clone())
        .with_data_files(self.data_files.clone())
        .with_output_requirements(self.output_requirements.clone())
        .with_rules(self.rules.clone())
    }

    fn converser<C: ResultChecker>(&self, checker: C) -> ResultConverser<C> {
        ResultConverser::new(
            self.manager.clone(),
            Arc::clone(&self.llm),
            self.settings.clone(),
            self.config.converser.clone(),
            checker,
        )
    }

    /// Asks every review question; returns the issues with suggested fixes.
    ///
    /// Each question and its answers are deleted afterwards. A question that
    /// never gets a valid answer contributes no issues.
    async fn review_output(&self, accepted: &CodeAndOutput) -> Result<Vec<(String, String)>> {
        let output = describe_outputs(accepted);
        let mut issues = Vec::new();
        for question in &self.review_questions {
            let request =
                render_prompt("output_review", &[("output", output.as_str()), ("question", question.as_str())])?;
            let mut converser = self.converser(JsonObjectChecker::new());
            let report = converser.run(&request).await?;
            converser.rewind_on_completion(Rewind::DeleteAll)?;
            if report.converged {
                issues.extend(converser.into_valid_result()?);
            } else {
                warn!(
                    "[{}] no valid answer to review question: {question}",
                    self.manager.name()
                );
            }
        }
        Ok(issues)
    }

    /// Asks for an explanation of the accepted code.
    async fn explain_code(&self) -> Result<Option<String>> {
        let request = render_prompt("code_explanation", &[("format", self.explanation_label.as_str())])?;
        let mut converser = self.converser(FencedBlockChecker::new(self.explanation_label.clone()));
        let report = converser.run(&request).await?;
        converser.rewind_on_completion(Rewind::DeleteAll)?;
        if !report.converged {
            warn!("[{}] the code was not explained", self.manager.name());
            return Ok(None);
        }
        converser.into_valid_result().map(Some)
    }
}

/// Issues as a bulleted list.
fn format_issues(issues: &[(String, String)]) -> String {
    let mut text = String::new();
    for (issue, fix) in issues {
        let _line_write = writeln!(text, "- {issue}: {fix}");
    }
    text.trim_end().to_owned()
}

/// Output of accepted code, as shown to the reviewer.
fn describe_outputs(accepted: &CodeAndOutput) -> String {
    let mut text = String::new();
    for (file, content) in &accepted.output_file_contents {
        let _file_write = write!(text, "\"{file}\":\n```output\n{}\n```\n\n", content.trim_end());
    }
    let operations = accepted.describe_dataframe_operations();
    if !operations.is_empty() {
        let _operations_write = write!(text, "Dataframe operations:\n{operations}");
    }
    if text.is_empty() {
        let files: Vec<&str> = accepted.all_created_files().into_iter().collect();
        return format!("The code created these files: {}.", files.join(", "));
    }
    text.trim_end().to_owned()
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

    #[test]
    fn test_format_issues() {
        let issues = vec![
            ("Missing p-value".to_owned(), "Report the p-value".to_owned()),
            ("Rounding".to_owned(), "Use 3 significant digits".to_owned()),
        ];
        assert_eq!(
            format_issues(&issues),
            "- Missing p-value: Report the p-value\n- Rounding: Use 3 significant digits"
        );
    }

    #[test]
    fn test_describe_outputs() {
        let mut accepted = CodeAndOutput::new("x = 1");
        accepted
            .output_file_contents
            .insert("results.txt".to_owned(), "mean: 3.2\n".to_owned());
        assert_eq!(
            describe_outputs(&accepted),
            "\"results.txt\":\n```output\nmean: 3.2\n```"
        );

        let mut files_only = CodeAndOutput::new("x = 1");
        files_only.created_files.insert(
            "*.csv".to_owned(),
            ["clean.csv".to_owned()].into_iter().collect(),
        );
        assert_eq!(describe_outputs(&files_only), "The code created these files: clean.csv.");
    }
}
