//! Integration tests for a whole code step: writing, output review, revision, explanation.

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

mod common;

use common::{GOOD_CODE, PRINT_CODE, ScriptedExecutor, code_conversation, results_file};
use paper_agent::CodeRevisionOrchestrator;
use paper_core::{CodeStep, Error, PipelineConfig, ProductField};
use paper_providers::ScriptedProvider;
use std::sync::Arc;

const REVISED_CODE: &str = "```python\nimport pandas as pd\nfrom scipy import stats\n\ndf = pd.read_csv('good.csv')\np_value = stats.ttest_1samp(df.bmi, 25).pvalue\nwith open('results.txt', 'w') as file:\n    file.write(f'mean: {df.bmi.mean()}')\n    file.write(f'p-value: {p_value}')\n```";

fn orchestrator(
    provider: &ScriptedProvider,
    executor: &ScriptedExecutor,
    config: PipelineConfig,
) -> CodeRevisionOrchestrator {
    CodeRevisionOrchestrator::new(
        CodeStep::DataAnalysis,
        code_conversation(),
        Arc::new(provider.clone()),
        Arc::new(executor.clone()),
        config,
    )
    .with_data(".", vec!["good.csv".to_owned()])
    .with_output_requirements(results_file())
    .with_goal("Test whether the mean BMI differs from 25.")
}

/// Tests the full step: one review issue, one revision, then an explanation.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_review_revision_and_explanation() {
    let provider = ScriptedProvider::new("performer").with_queued_all([
        GOOD_CODE,
        "```json\n{\"Missing p-value\": \"Test the mean against 25 and report the p-value\"}\n```",
        REVISED_CODE,
        "No further issues:\n```json\n{}\n```",
        "```markdown\nThe code loads the data and tests the mean BMI against 25.\n```",
    ]);
    let executor = ScriptedExecutor::new();
    let orchestrator = orchestrator(&provider, &executor, PipelineConfig::default())
        .with_review_question("Does the output contain everything needed to answer the goal?");

    let accepted = orchestrator.run().await.unwrap();

    assert!(accepted.code.contains("ttest_1samp"));
    assert_eq!(accepted.output.as_deref(), Some("mean: 3.2\np-value: 0.01\n"));
    assert_eq!(
        accepted.explanation.as_deref(),
        Some("The code loads the data and tests the mean BMI against 25.")
    );
    assert_eq!(provider.call_count(), 5);
    assert_eq!(executor.runs().len(), 2);

    let history = provider.call_history();
    let revision_request = history[2].last_user_content().unwrap();
    assert!(revision_request.contains("- Missing p-value: Test the mean"));
    let review_request = history[1].last_user_content().unwrap();
    assert!(review_request.contains("mean: 3.2"));

    // Review questions and the explanation request are removed once answered.
    let conversation = orchestrator.manager().conversation().unwrap();
    assert_eq!(conversation.len(), 5);
    assert!(conversation.last_message().unwrap().content.contains("ttest_1samp"));
}

/// Tests that the step fails after every code writing attempt is exhausted.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_exhausted_writing_attempts_fail_the_product() {
    let provider = ScriptedProvider::new("performer").with_default_response(PRINT_CODE);
    let executor = ScriptedExecutor::new();
    let mut config = PipelineConfig::default();
    config.debugger.max_debug_iterations = 2;
    config.code.max_code_writing_attempts = 2;
    let orchestrator = orchestrator(&provider, &executor, config);

    let error = orchestrator.run().await.unwrap_err();

    match error {
        Error::FailedCreatingProduct(product) => {
            assert_eq!(product, ProductField::Codes(CodeStep::DataAnalysis).to_string());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.call_count(), 4);
    assert_eq!(orchestrator.manager().len().unwrap(), 1);
}

/// Tests that a failed revision keeps the previously accepted code.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_failed_revision_keeps_accepted_code() {
    let provider = ScriptedProvider::new("performer")
        .with_queued_all([
            GOOD_CODE,
            "```json\n{\"Rounding\": \"Round the mean to two decimals\"}\n```",
        ])
        .with_default_response(PRINT_CODE);
    let executor = ScriptedExecutor::new();
    let mut config = PipelineConfig::default();
    config.debugger.max_debug_iterations = 2;
    config.code.explain_code = false;
    let orchestrator = orchestrator(&provider, &executor, config)
        .with_review_question("Are the numbers formatted sensibly?");

    let accepted = orchestrator.run().await.unwrap();

    assert!(accepted.code.contains("df.bmi.mean()"));
    assert!(!accepted.code.contains("print("));
    assert_eq!(accepted.explanation, None);
    assert_eq!(provider.call_count(), 4);
    // System prompt, request and the reposted code; the failed revision is gone.
    assert_eq!(orchestrator.manager().len().unwrap(), 3);
}
