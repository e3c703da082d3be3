//! Python process sandbox.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::fs::{create_dir_all, read_dir, read_to_string, write};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use paper_core::{DataframeOperation, DebuggerConfig, Error, Result};

use super::sandbox::{CodeExecutor, ExecutionFailure, RunOutcome, RunRequest};

/// Script wrapping the submitted code.
const HARNESS: &str = include_str!("harness.py");

/// Configuration handed to the harness.
#[derive(Debug, Serialize)]
struct HarnessConfig<'request> {
    /// Submitted code file
    code_path: PathBuf,
    /// Where the harness writes its report
    report_path: PathBuf,
    /// Files the code may read
    allowed_read_files: &'request [String],
    /// Glob patterns the code may write
    allowed_write_patterns: Vec<&'request str>,
    /// Builtins replaced by failing stubs
    forbidden_functions: &'request [String],
    /// Modules the code may not import
    forbidden_modules: &'request [String],
}

/// Report written by the harness.
#[derive(Debug, Deserialize)]
struct HarnessReport {
    /// Captured standard output
    output: String,
    /// Dataframe reads and writes
    #[serde(default)]
    dataframe_operations: Vec<DataframeOperation>,
    /// Failure, if any
    failure: Option<ExecutionFailure>,
}

/// Runs code in a Python subprocess under an embedded harness.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    /// Interpreter to launch
    python: PathBuf,
}

impl PythonSandbox {
    /// Uses the given interpreter.
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Uses the interpreter named in the debugger configuration.
    pub fn from_config(config: &DebuggerConfig) -> Self {
        Self::new(config.python.clone())
    }
}

/// Names of the files directly inside `folder`.
async fn list_files(folder: &Path) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    let mut entries = read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(files)
}

/// Files created during the run, read back where the requirements ask for it.
async fn collect_created_files(
    request: &RunRequest,
    before: &BTreeSet<String>,
) -> Result<BTreeMap<String, Option<String>>> {
    let after = list_files(&request.run_folder).await?;
    let mut created = BTreeMap::new();
    for file in after.difference(before) {
        let content = if request.output_requirements.keeps_content(file) {
            read_to_string(request.run_folder.join(file)).await.ok()
        } else {
            None
        };
        created.insert(file.clone(), content);
    }
    Ok(created)
}

#[async_trait]
impl CodeExecutor for PythonSandbox {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        create_dir_all(&request.run_folder).await?;
        let before = list_files(&request.run_folder).await?;

        let work = TempDir::new()?;
        let harness_path = work.path().join("harness.py");
        let config_path = work.path().join("config.json");
        let code_path = work.path().join("code.py");
        let report_path = work.path().join("report.json");
        write(&harness_path, HARNESS).await?;
        write(&code_path, &request.code).await?;

        let config = HarnessConfig {
            code_path,
            report_path: report_path.clone(),
            allowed_read_files: &request.allowed_read_files,
            allowed_write_patterns: request
                .output_requirements
                .iter()
                .map(|requirement| requirement.pattern.as_str())
                .collect(),
            forbidden_functions: &request.rules.forbidden_functions,
            forbidden_modules: &request.rules.forbidden_modules,
        };
        write(&config_path, serde_json::to_vec(&config)?).await?;

        debug!(
            "Running {} lines of code in {}",
            request.code.lines().count(),
            request.run_folder.display()
        );
        let child = Command::new(&self.python)
            .arg(&harness_path)
            .arg(&config_path)
            .current_dir(&request.run_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::Sandbox(format!("Failed to start {}: {err}", self.python.display()))
            })?;

        let Ok(output) = timeout(request.timeout, child.wait_with_output()).await else {
            warn!("Code run timed out after {:?}", request.timeout);
            return Ok(RunOutcome {
                output: String::new(),
                created_files: collect_created_files(request, &before).await?,
                dataframe_operations: Vec::new(),
                failure: Some(ExecutionFailure::Timeout {
                    seconds: request.timeout.as_secs(),
                }),
            });
        };
        let output = output?;

        let report: HarnessReport = match read_to_string(&report_path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(err) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Sandbox(format!(
                    "The harness wrote no report ({err}); exit status {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }
        };

        let created_files = collect_created_files(request, &before).await?;
        info!(
            "Code run finished: {} created file(s), {}",
            created_files.len(),
            report
                .failure
                .as_ref()
                .map_or_else(|| "no failure".to_owned(), |failure| format!("{failure:?}"))
        );
        Ok(RunOutcome {
            output: report.output,
            created_files,
            dataframe_operations: report.dataframe_operations,
            failure: report.failure,
        })
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
    use crate::code::requirements::{OutputFileRequirement, OutputFileRequirements};
    use crate::code::static_checks::CodeRules;
    use std::time::Duration;

    #[test]
    fn test_harness_config_serialization() {
        let allowed = vec!["data.csv".to_owned()];
        let rules = CodeRules::default();
        let requirements =
            OutputFileRequirements::new().with(OutputFileRequirement::text_file("results.txt"));
        let config = HarnessConfig {
            code_path: PathBuf::from("code.py"),
            report_path: PathBuf::from("report.json"),
            allowed_read_files: &allowed,
            allowed_write_patterns: requirements
                .iter()
                .map(|requirement| requirement.pattern.as_str())
                .collect(),
            forbidden_functions: &rules.forbidden_functions,
            forbidden_modules: &rules.forbidden_modules,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["allowed_write_patterns"][0], "results.txt");
        assert_eq!(json["forbidden_functions"][0], "print");
    }

    #[test]
    fn test_harness_report_parsing() {
        let report: HarnessReport = serde_json::from_str(
            r#"{"output": "", "dataframe_operations": [], "failure": {"kind": "forbidden_function", "name": "print"}}"#,
        )
        .unwrap();
        assert_eq!(
            report.failure,
            Some(ExecutionFailure::ForbiddenFunction {
                name: "print".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_a_sandbox_error() {
        let folder = TempDir::new().unwrap();
        let sandbox = PythonSandbox::new("/nonexistent/python-interpreter");
        let request = RunRequest {
            code: "x = 1".to_owned(),
            run_folder: folder.path().to_path_buf(),
            allowed_read_files: Vec::new(),
            output_requirements: OutputFileRequirements::new(),
            rules: CodeRules::default(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(sandbox.run(&request).await, Err(Error::Sandbox(_))));
    }
}
