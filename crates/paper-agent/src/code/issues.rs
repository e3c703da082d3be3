//! Run issue taxonomy.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// What went wrong with a code submission, ordered by how early in the
/// pipeline the problem was detected.
///
/// The order is significant: the debugger compares problems of consecutive
/// submissions and reads its repair table by [`CodeProblem::stage_row`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CodeProblem {
    /// The code block is cut off
    IncompleteBlock,
    /// No code block, or more than one
    NotSingleBlock,
    /// Static pre-execution checks failed
    StaticCheck,
    /// The code raised, warned, timed out or broke a sandbox rule
    RuntimeError,
    /// Output files exist but their content is unacceptable
    OutputFileAnnotation,
    /// Required output files were not created
    MissingOutputFiles,
    /// Everything passed
    AllOk,
    /// Nothing to report
    NoCode,
}

impl CodeProblem {
    /// Row of the repair table for this problem.
    pub const fn stage_row(self) -> usize {
        match self {
            Self::IncompleteBlock => 0,
            Self::NotSingleBlock => 1,
            Self::StaticCheck => 2,
            Self::RuntimeError => 3,
            Self::OutputFileAnnotation | Self::MissingOutputFiles => 4,
            Self::AllOk | Self::NoCode => 5,
        }
    }
}

/// A single problem found in a submission, with instructions for fixing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIssue {
    /// Heading the issue is grouped under
    pub category: String,
    /// What is wrong
    pub issue: String,
    /// How to fix it
    pub instructions: Option<String>,
    /// Problem class
    pub code_problem: CodeProblem,
    /// Short note for logs
    pub comment: Option<String>,
}

impl RunIssue {
    /// Creates an issue without instructions.
    pub fn new(
        category: impl Into<String>,
        issue: impl Into<String>,
        code_problem: CodeProblem,
    ) -> Self {
        Self {
            category: category.into(),
            issue: issue.into(),
            instructions: None,
            code_problem,
            comment: None,
        }
    }

    /// Adds fixing instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Adds a log comment.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Issues found in one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIssues {
    /// Issues in detection order
    issues: Vec<RunIssue>,
}

impl RunIssues {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an issue.
    pub fn push(&mut self, issue: RunIssue) {
        self.issues.push(issue);
    }

    /// Whether no issue was found.
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Number of issues.
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Issues in detection order.
    pub fn iter(&self) -> impl Iterator<Item = &RunIssue> {
        self.issues.iter()
    }

    /// Most severe problem, or [`CodeProblem::AllOk`] when empty.
    pub fn problem(&self) -> CodeProblem {
        self.issues
            .iter()
            .map(|issue| issue.code_problem)
            .min()
            .unwrap_or(CodeProblem::AllOk)
    }

    /// Feedback message grouping issues under their category.
    pub fn feedback_message(&self) -> String {
        let mut grouped: BTreeMap<&str, Vec<&RunIssue>> = BTreeMap::new();
        for issue in &self.issues {
            grouped.entry(issue.category.as_str()).or_default().push(issue);
        }

        let mut message = String::new();
        for (category, issues) in grouped {
            let _heading_write = writeln!(message, "# {category}");
            for issue in issues {
                let _issue_write = writeln!(message, "{}", issue.issue.trim_end());
                if let Some(instructions) = &issue.instructions {
                    let _instructions_write = writeln!(message, "{}", instructions.trim_end());
                }
                message.push('\n');
            }
        }
        message.trim_end().to_owned()
    }
}

impl Extend<RunIssue> for RunIssues {
    fn extend<I: IntoIterator<Item = RunIssue>>(&mut self, iter: I) {
        self.issues.extend(iter);
    }
}

impl FromIterator<RunIssue> for RunIssues {
    fn from_iter<I: IntoIterator<Item = RunIssue>>(iter: I) -> Self {
        Self {
            issues: iter.into_iter().collect(),
        }
    }
}

/// Marks the elided middle of a trimmed traceback.
const TRACEBACK_ELISION: &str = "\n...\n";

/// Shortens a traceback to at most `max_chars`, keeping its head and tail.
pub fn trim_traceback(traceback: &str, max_chars: usize) -> String {
    let total = traceback.chars().count();
    if total <= max_chars {
        return traceback.to_owned();
    }
    let keep = max_chars.saturating_sub(TRACEBACK_ELISION.len());
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let head: String = traceback.chars().take(head_len).collect();
    let tail: String = traceback.chars().skip(total - tail_len).collect();
    format!("{head}{TRACEBACK_ELISION}{tail}")
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
    fn test_problem_is_most_severe() {
        let mut issues = RunIssues::new();
        assert_eq!(issues.problem(), CodeProblem::AllOk);
        issues.push(RunIssue::new("Output", "missing", CodeProblem::MissingOutputFiles));
        issues.push(RunIssue::new("Runtime", "boom", CodeProblem::RuntimeError));
        assert_eq!(issues.problem(), CodeProblem::RuntimeError);
    }

    #[test]
    fn test_stage_rows() {
        assert_eq!(CodeProblem::IncompleteBlock.stage_row(), 0);
        assert_eq!(CodeProblem::OutputFileAnnotation.stage_row(), 4);
        assert_eq!(CodeProblem::MissingOutputFiles.stage_row(), 4);
        assert_eq!(CodeProblem::AllOk.stage_row(), 5);
        assert!(CodeProblem::StaticCheck < CodeProblem::RuntimeError);
    }

    #[test]
    fn test_feedback_groups_by_category() {
        let issues: RunIssues = [
            RunIssue::new("Imports", "Do not import `os`.", CodeProblem::StaticCheck),
            RunIssue::new("Headers", "Missing `# ANALYSIS`.", CodeProblem::StaticCheck)
                .with_instructions("Add the header."),
            RunIssue::new("Imports", "Do not import `sys`.", CodeProblem::StaticCheck),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            issues.feedback_message(),
            "# Headers\nMissing `# ANALYSIS`.\nAdd the header.\n\n# Imports\nDo not import `os`.\n\nDo not import `sys`."
        );
    }

    #[test]
    fn test_trim_traceback() {
        let traceback = "a".repeat(50) + &"b".repeat(50);
        let trimmed = trim_traceback(&traceback, 25);
        assert_eq!(trimmed.chars().count(), 25);
        assert!(trimmed.starts_with("aaaa"));
        assert!(trimmed.ends_with("bbbb"));
        assert!(trimmed.contains("\n...\n"));
        assert_eq!(trim_traceback("short", 25), "short");
    }
}
