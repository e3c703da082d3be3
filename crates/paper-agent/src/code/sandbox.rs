//! Code execution contract.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use paper_core::{DataframeOperation, Result};

use super::issues::{CodeProblem, RunIssue, trim_traceback};
use super::requirements::OutputFileRequirements;
use super::static_checks::CodeRules;

/// Everything a sandbox needs to run one submission.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Code to run
    pub code: String,
    /// Directory holding the data files; outputs are created here
    pub run_folder: PathBuf,
    /// Files the code may read, relative to the run folder
    pub allowed_read_files: Vec<String>,
    /// Files the code may and must create
    pub output_requirements: OutputFileRequirements,
    /// Forbidden functions and modules
    pub rules: CodeRules,
    /// Wall-clock limit
    pub timeout: Duration,
}

/// Why a run did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The code raised
    Exception {
        /// Exception class name
        type_name: String,
        /// Exception message
        message: String,
        /// Formatted traceback
        traceback: String,
    },
    /// The code emitted a warning, which is treated as an error
    Warning {
        /// Warning message
        message: String,
        /// Formatted traceback
        traceback: String,
    },
    /// The wall-clock limit was reached
    Timeout {
        /// Limit that was exceeded
        seconds: u64,
    },
    /// The code opened a file it may not read
    ForbiddenRead {
        /// File that was opened
        file: String,
    },
    /// The code opened a file it may not write
    ForbiddenWrite {
        /// File that was opened
        file: String,
    },
    /// The code called a forbidden builtin
    ForbiddenFunction {
        /// Name of the builtin
        name: String,
    },
    /// The code imported a forbidden module
    ForbiddenImport {
        /// Module name
        module: String,
    },
}

impl ExecutionFailure {
    /// Describes the failure as a run issue for the model.
    pub fn to_issue(&self, request: &RunRequest, max_traceback_chars: usize) -> RunIssue {
        let runtime = |issue: String| RunIssue::new("Runtime", issue, CodeProblem::RuntimeError);
        match self {
            Self::Exception {
                type_name,
                message,
                ..
            } if type_name == "FileNotFoundError" => runtime(format!(
                "Your code tried to read a file that does not exist: {message}"
            ))
            .with_instructions(format!(
                "The available data files are: {}.",
                quoted_list(&request.allowed_read_files)
            )),
            Self::Exception {
                type_name,
                message,
                traceback,
            } => runtime(format!(
                "Your code raised an exception:\n```error\n{}\n```",
                trim_traceback(
                    &traceback_or(traceback, || format!("{type_name}: {message}")),
                    max_traceback_chars
                )
            ))
            .with_comment(type_name.clone()),
            Self::Warning { message, traceback } => runtime(format!(
                "Your code produced a warning:\n```error\n{}\n```",
                trim_traceback(
                    &traceback_or(traceback, || message.clone()),
                    max_traceback_chars
                )
            ))
            .with_instructions("Please fix the code so that it runs without warnings."),
            Self::Timeout { seconds } => runtime(format!(
                "Your code did not finish within {seconds} seconds."
            ))
            .with_instructions("Make the code run faster, for example by avoiding loops over rows."),
            Self::ForbiddenRead { file } if request.output_requirements.allows(file) => runtime(
                format!("Your code reads back the output file \"{file}\" it is supposed to create."),
            )
            .with_instructions("Do not read your own output files; keep the values in variables instead."),
            Self::ForbiddenRead { file } => runtime(format!(
                "Your code reads the file \"{file}\", which is not one of the data files."
            ))
            .with_instructions(format!(
                "You may only read these files: {}.",
                quoted_list(&request.allowed_read_files)
            )),
            Self::ForbiddenWrite { file } => runtime(format!(
                "Your code writes to the file \"{file}\", which is not an allowed output file."
            ))
            .with_instructions(request.output_requirements.describe_allowed()),
            Self::ForbiddenFunction { name } if name == "print" => {
                let primary = request
                    .output_requirements
                    .iter()
                    .find(|requirement| requirement.keep_content);
                match primary {
                    Some(requirement) => runtime("Your code uses the `print` function.".to_owned())
                        .with_instructions(format!(
                            "Do not print anything. Write the results to \"{}\" instead.",
                            requirement.pattern
                        )),
                    None => runtime("Your code uses the `print` function.".to_owned())
                        .with_instructions(
                            "Do not print anything. This code should not produce any text output; \
                             use assertions to report problems.",
                        ),
                }
            }
            Self::ForbiddenFunction { name } => {
                runtime(format!("Your code uses the function `{name}`, which is not allowed."))
            }
            Self::ForbiddenImport { module } => runtime(format!(
                "Your code imports the module `{module}`, which is not allowed."
            )),
        }
    }
}

fn quoted_list(files: &[String]) -> String {
    files
        .iter()
        .map(|file| format!("\"{file}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The traceback, or a one-line summary when none was captured.
fn traceback_or(traceback: &str, summary: impl FnOnce() -> String) -> String {
    if traceback.trim().is_empty() {
        summary()
    } else {
        traceback.trim_end().to_owned()
    }
}

/// What a run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Captured standard output
    pub output: String,
    /// Files created in the run folder, with their content when read back
    pub created_files: BTreeMap<String, Option<String>>,
    /// Dataframe reads and writes
    pub dataframe_operations: Vec<DataframeOperation>,
    /// Why the run failed, if it did
    pub failure: Option<ExecutionFailure>,
}

/// Runs code under the restrictions of a [`RunRequest`].
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Runs the code.
    ///
    /// Failures of the code itself are reported in [`RunOutcome::failure`].
    ///
    /// # Errors
    /// Returns [`paper_core::Error::Sandbox`] or an I/O error if the code
    /// could not be run at all.
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome>;
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
    use crate::code::requirements::OutputFileRequirement;

    fn request(outputs: OutputFileRequirements) -> RunRequest {
        RunRequest {
            code: String::new(),
            run_folder: PathBuf::from("."),
            allowed_read_files: vec!["good.csv".to_owned()],
            output_requirements: outputs,
            rules: CodeRules::default(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_file_not_found_lists_data_files() {
        let failure = ExecutionFailure::Exception {
            type_name: "FileNotFoundError".to_owned(),
            message: "[Errno 2] No such file or directory: 'bad.csv'".to_owned(),
            traceback: String::new(),
        };
        let issue = failure.to_issue(&request(OutputFileRequirements::new()), 2000);
        let text = format!("{}\n{}", issue.issue, issue.instructions.unwrap_or_default());
        assert!(text.contains("bad.csv"));
        assert!(text.contains("good.csv"));
        assert_eq!(issue.code_problem, CodeProblem::RuntimeError);
    }

    #[test]
    fn test_print_message_depends_on_outputs() {
        let failure = ExecutionFailure::ForbiddenFunction {
            name: "print".to_owned(),
        };
        let with_output = failure.to_issue(
            &request(OutputFileRequirements::new().with(OutputFileRequirement::text_file("results.txt"))),
            2000,
        );
        assert!(with_output.instructions.unwrap_or_default().contains("results.txt"));

        let without_output = failure.to_issue(&request(OutputFileRequirements::new()), 2000);
        assert!(
            without_output
                .instructions
                .unwrap_or_default()
                .contains("should not produce any text output")
        );
    }

    #[test]
    fn test_reading_own_output_is_distinguished() {
        let outputs = OutputFileRequirements::new().with(OutputFileRequirement::text_file("results.txt"));
        let own = ExecutionFailure::ForbiddenRead {
            file: "results.txt".to_owned(),
        }
        .to_issue(&request(outputs.clone()), 2000);
        assert!(own.issue.contains("output file"));

        let other = ExecutionFailure::ForbiddenRead {
            file: "secret.csv".to_owned(),
        }
        .to_issue(&request(outputs), 2000);
        assert!(other.issue.contains("not one of the data files"));
    }

    #[test]
    fn test_outcome_report_format() {
        let report = r#"{
            "output": "",
            "created_files": {"results.txt": "done"},
            "dataframe_operations": [{"operation": "read", "file": "good.csv", "columns": ["a"]}],
            "failure": {"kind": "timeout", "seconds": 60}
        }"#;
        let outcome: RunOutcome = serde_json::from_str(report).unwrap();
        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout { seconds: 60 }));
        assert_eq!(outcome.dataframe_operations[0].file(), "good.csv");
    }
}
