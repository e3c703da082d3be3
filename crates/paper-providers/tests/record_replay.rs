//! Integration tests for the provider stack used by live and replayed runs.

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

use paper_core::{
    ActionsAndConversations, ConversationManager, LlmClient, LlmError, LlmSettings,
};
use paper_providers::{LlmCallLog, RecordingClient, ReplayClient, RetryingClient, ScriptedProvider};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn converse(client: &dyn LlmClient) -> Vec<String> {
    let manager =
        ConversationManager::new(ActionsAndConversations::new(), "performer").unwrap();
    manager.initialize("You are a scientist.").unwrap();
    let mut settings = LlmSettings::default();
    let mut answers = Vec::new();
    for question in ["What is the goal?", "Any hypothesis?"] {
        manager.append_user(question, None).unwrap();
        answers.push(manager.get_response(client, &mut settings, None).await.unwrap());
    }
    answers
}

/// Tests that a recorded run replays to the same answers without a live client.
///
/// # Panics
/// Panics if recording or replay fails.
#[tokio::test]
async fn test_recorded_run_replays_identically() {
    let temp = TempDir::new().unwrap();
    let log_path = temp.path().join("llm_calls.json");

    let live = ScriptedProvider::new("live")
        .with_queued_error(LlmError::Server("overloaded".to_owned()))
        .with_queued_all(["Study smoking and BMI.", "Smokers have lower BMI."]);
    let retrying = RetryingClient::new(Arc::new(live.clone()), 3, Duration::from_millis(1));
    let recording = RecordingClient::new(Arc::new(retrying), &log_path);

    let recorded_answers = converse(&recording).await;
    assert_eq!(recording.recorded(), 2);
    assert_eq!(live.call_count(), 3);

    let replay = ReplayClient::new(LlmCallLog::load(&log_path).unwrap(), true)
        .with_request_verification(true);
    let replayed_answers = converse(&replay).await;

    assert_eq!(replayed_answers, recorded_answers);
    assert_eq!(replay.served(), 2);
}
