//! Integration tests running submitted code through the Python harness.
//!
//! Every test returns early when no `python3` interpreter is installed.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use paper_agent::{
    CodeExecutor, CodeRules, ExecutionFailure, OutputFileRequirement, OutputFileRequirements,
    PythonSandbox, RunOutcome, RunRequest,
};
use std::fs;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

const PYTHON: &str = "python3";

async fn python_available() -> bool {
    Command::new(PYTHON)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

/// Runs `code` in a fresh folder holding `data.csv` and a stray `notes.txt`.
async fn run(code: &str) -> (RunOutcome, TempDir) {
    let folder = TempDir::new().unwrap();
    fs::write(folder.path().join("data.csv"), "bmi\n22.5\n").unwrap();
    fs::write(folder.path().join("notes.txt"), "not a data file").unwrap();
    let request = RunRequest {
        code: code.to_owned(),
        run_folder: folder.path().to_path_buf(),
        allowed_read_files: vec!["data.csv".to_owned()],
        output_requirements: OutputFileRequirements::new()
            .with(OutputFileRequirement::text_file("results.txt").as_primary()),
        rules: CodeRules::default(),
        timeout: Duration::from_secs(30),
    };
    let outcome = PythonSandbox::new(PYTHON).run(&request).await.unwrap();
    (outcome, folder)
}

/// Tests that a forbidden import is reported even when the code catches it.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_caught_forbidden_import_is_reported() {
    if !python_available().await {
        return;
    }

    let (outcome, _folder) = run(
        "try:\n    import os\nexcept Exception:\n    pass\n\nwith open('results.txt', 'w') as file:\n    file.write('mean: 22.5')\n",
    )
    .await;

    assert_eq!(
        outcome.failure,
        Some(ExecutionFailure::ForbiddenImport {
            module: "os".to_owned()
        })
    );
}

/// Tests that the first of several swallowed file violations is reported.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_swallowed_file_violations_are_reported() {
    if !python_available().await {
        return;
    }

    let (outcome, _folder) = run(
        "try:\n    open('notes.txt').read()\nexcept:\n    pass\ntry:\n    open('undeclared.txt', 'w')\nexcept Exception:\n    pass\n",
    )
    .await;

    assert_eq!(
        outcome.failure,
        Some(ExecutionFailure::ForbiddenRead {
            file: "notes.txt".to_owned()
        })
    );
}

/// Tests that forbidden builtins cannot be reached through the `builtins` module.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_builtins_module_cannot_bypass_forbidden_functions() {
    if !python_available().await {
        return;
    }

    let (outcome, _folder) = run("import builtins\nbuiltins.print('mean: 22.5')\n").await;

    assert_eq!(
        outcome.failure,
        Some(ExecutionFailure::ForbiddenFunction {
            name: "print".to_owned()
        })
    );
}

/// Tests that code within the rules runs and its output file is collected.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_clean_code_creates_results() {
    if !python_available().await {
        return;
    }

    let (outcome, folder) = run(
        "with open('data.csv') as data:\n    rows = data.read().splitlines()[1:]\nwith open('results.txt', 'w') as file:\n    file.write(f'rows: {len(rows)}')\n",
    )
    .await;

    assert_eq!(outcome.failure, None);
    assert_eq!(
        outcome.created_files.get("results.txt"),
        Some(&Some("rows: 1".to_owned()))
    );
    assert!(folder.path().join("results.txt").exists());
}
