//! Integration tests for the debugger's repair decisions and conversation rewinds.

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

use common::{
    BAD_FILE_CODE, GOOD_CODE, OS_CODE, PRINT_CODE, ScriptedExecutor, code_conversation,
    results_file,
};
use paper_agent::{CodeProblem, Debugger, RepairAction};
use paper_core::{Action, DebuggerConfig, LlmSettings, ModelEngine, Role};
use paper_providers::ScriptedProvider;
use std::sync::Arc;

const REQUEST: &str = "Write the data analysis code.";

fn debugger(provider: &ScriptedProvider, executor: &ScriptedExecutor, max_iterations: u32) -> Debugger {
    let config = DebuggerConfig {
        max_debug_iterations: max_iterations,
        ..DebuggerConfig::default()
    };
    Debugger::new(
        code_conversation(),
        Arc::new(provider.clone()),
        LlmSettings::default(),
        Arc::new(executor.clone()),
        config,
    )
    .with_data_files(vec!["good.csv".to_owned()])
    .with_output_requirements(results_file())
}

fn actions(debugger: &Debugger) -> Vec<RepairAction> {
    debugger.repair_log().iter().map(|record| record.action).collect()
}

/// Tests that working code is accepted after one iteration with a clean history.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_clean_code_path() {
    let provider = ScriptedProvider::new("performer").with_queued(GOOD_CODE);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    let accepted = debugger.run_debugging(REQUEST).await.unwrap().unwrap();

    assert_eq!(provider.call_count(), 1);
    assert_eq!(actions(&debugger), vec![RepairAction::Repost(0)]);
    assert_eq!(accepted.output.as_deref(), Some("mean: 3.2\n"));
    assert!(accepted.code.contains("pd.read_csv('good.csv')"));
    assert_eq!(accepted.created_files_for("results.txt"), vec!["results.txt"]);
    assert_eq!(accepted.dataframe_operations.len(), 1);

    let conversation = debugger.manager().conversation().unwrap();
    let before = debugger.conversation_len_before_first_response();
    assert_eq!(conversation.len(), before + 2);
    assert_eq!(conversation.get(before).unwrap().content, REQUEST);
    let response = conversation.last_message().unwrap();
    assert_eq!(response.role, Role::Assistant);
    assert!(response.content.contains("```python\nimport pandas as pd"));
}

/// Tests recovery from reading a file that is not a data file.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_file_not_found_is_recovered() {
    let provider = ScriptedProvider::new("performer")
        .with_queued(BAD_FILE_CODE)
        .with_queued(GOOD_CODE);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    let accepted = debugger.run_debugging(REQUEST).await.unwrap();

    assert!(accepted.is_some());
    assert_eq!(debugger.repair_log().len(), 2);
    assert_eq!(debugger.repair_log()[0].problem, CodeProblem::RuntimeError);
    assert_eq!(
        actions(&debugger),
        vec![RepairAction::Repost(0), RepairAction::Repost(0)]
    );

    let feedback = provider.call_history()[1]
        .last_user_content()
        .unwrap()
        .to_owned();
    assert!(feedback.contains("bad.csv"), "{feedback}");
    assert!(feedback.contains("good.csv"), "{feedback}");

    let before = debugger.conversation_len_before_first_response();
    assert_eq!(debugger.manager().len().unwrap(), before + 2);
}

/// Tests that an exhausted budget returns nothing and removes the whole exchange.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_exhausted_budget_rewinds_to_before_request() {
    let provider = ScriptedProvider::new("performer").with_default_response(PRINT_CODE);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 3);

    let accepted = debugger.run_debugging(REQUEST).await.unwrap();

    assert!(accepted.is_none());
    assert_eq!(provider.call_count(), 3);
    assert_eq!(executor.runs().len(), 3);
    assert_eq!(
        debugger.manager().len().unwrap(),
        debugger.conversation_len_before_first_response()
    );
    let feedback = provider.call_history()[2]
        .last_user_content()
        .unwrap()
        .to_owned();
    assert!(feedback.contains("`print`"));
    assert!(feedback.contains("results.txt"));

    let restart_noted = debugger.manager().registry().actions().iter().any(|action| {
        matches!(action, Action::Comment { text, .. } if text.contains("restart from scratch"))
    });
    assert!(restart_noted);
}

/// Tests that a repost after repeated failures leaves only the request and the code.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_repost_discards_debug_exchanges() {
    let provider = ScriptedProvider::new("performer")
        .with_queued_all([PRINT_CODE, PRINT_CODE, BAD_FILE_CODE, GOOD_CODE]);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    assert!(debugger.run_debugging(REQUEST).await.unwrap().is_some());

    let before = debugger.conversation_len_before_first_response();
    let conversation = debugger.manager().conversation().unwrap();
    assert_eq!(conversation.len(), before + 2);
    assert!(!conversation.iter().any(|message| message.content.contains("print(")));
}

/// Tests that a response without a code block is left in place with feedback.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_missing_block_is_left_then_reposted() {
    let provider = ScriptedProvider::new("performer")
        .with_queued("I would load the data with pandas and compute the mean.")
        .with_queued(GOOD_CODE);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    assert!(debugger.run_debugging(REQUEST).await.unwrap().is_some());

    assert_eq!(
        actions(&debugger),
        vec![RepairAction::Leave, RepairAction::Repost(0)]
    );
    assert_eq!(debugger.repair_log()[1].response_count, 1);
    // The second request still saw the prose answer and the feedback.
    assert_eq!(provider.call_history()[1].messages.len(), 4);
    assert_eq!(executor.runs().len(), 1);
}

/// Tests that a cut-off block is regenerated with a larger context tier.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_incomplete_block_is_regenerated() {
    let provider = ScriptedProvider::new("performer")
        .with_queued("```python\nimport pandas as pd\n\ndf = pd.read_csv(")
        .with_queued(GOOD_CODE);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    assert!(debugger.run_debugging(REQUEST).await.unwrap().is_some());

    assert_eq!(
        actions(&debugger),
        vec![RepairAction::Regenerate(0), RepairAction::Repost(0)]
    );
    let history = provider.call_history();
    assert_eq!(history[1].messages.len(), history[0].messages.len());
    assert_eq!(history[1].engine, ModelEngine::FastLongContext);
    assert_eq!(debugger.settings().engine, ModelEngine::FastLongContext);
}

/// Tests that a regression to an earlier stage regenerates instead of reposting.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_regression_to_static_check_regenerates() {
    let provider = ScriptedProvider::new("performer")
        .with_queued_all([BAD_FILE_CODE, OS_CODE, GOOD_CODE]);
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12);

    assert!(debugger.run_debugging(REQUEST).await.unwrap().is_some());

    let problems: Vec<CodeProblem> = debugger
        .repair_log()
        .iter()
        .map(|record| record.problem)
        .collect();
    assert_eq!(
        problems,
        vec![CodeProblem::RuntimeError, CodeProblem::StaticCheck, CodeProblem::AllOk]
    );
    assert_eq!(
        actions(&debugger),
        vec![
            RepairAction::Repost(0),
            RepairAction::Regenerate(1),
            RepairAction::Repost(0)
        ]
    );
    // The static check failure was never run.
    assert_eq!(executor.runs().len(), 2);
    // The regenerated request ends with the runtime feedback, not the static one.
    let feedback = provider.call_history()[2]
        .last_user_content()
        .unwrap()
        .to_owned();
    assert!(feedback.contains("bad.csv"));
    assert!(!feedback.contains("`os`"));
}

/// Tests that a revision dropping most of the previous code is rejected.
///
/// # Panics
/// Panics if assertions fail during test execution.
#[tokio::test]
async fn test_small_change_guard() {
    let previous = "import pandas as pd\n\ndf = pd.read_csv('good.csv')\nmean = df.bmi.mean()\nstd = df.bmi.std()\nwith open('results.txt', 'w') as file:\n    file.write(f'mean: {mean}')\n    file.write(f'std: {std}')\n";
    let provider = ScriptedProvider::new("performer")
        .with_queued("```python\nimport pandas as pd\n```")
        .with_queued(format!("```python\n{previous}file = None\n```"));
    let executor = ScriptedExecutor::new();
    let mut debugger = debugger(&provider, &executor, 12).requesting_small_change(previous);

    assert!(debugger.run_debugging("Please also report the standard deviation.").await.unwrap().is_some());

    assert_eq!(debugger.repair_log()[0].problem, CodeProblem::StaticCheck);
    assert_eq!(executor.runs().len(), 1);
}
