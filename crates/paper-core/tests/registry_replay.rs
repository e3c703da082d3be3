//! Integration tests for stage checkpoints and the persisted action log.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::assertions_on_result_states,
        reason = "Test allows"
    )
)]

use paper_core::{
    Action, ActionLogWriter, ActionsAndConversations, ConversationManager, Position,
    read_action_log,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Tests that resetting to a stage rebuilds every conversation from the retained log.
///
/// # Panics
/// Panics if the registry fails to replay its actions.
#[test]
fn test_reset_to_stage_restores_all_managers() {
    let registry = ActionsAndConversations::new();
    let code = ConversationManager::new(registry.clone(), "code").unwrap();
    code.initialize("You write Python code.").unwrap();
    code.append_user("Write the analysis code.", Some("request"))
        .unwrap();

    registry.mark_stage("debugging");
    code.append_assistant("print('hello')", None).unwrap();
    code.append_user("Do not use print.", None).unwrap();
    let review = ConversationManager::with_unique_name(registry.clone(), "code").unwrap();
    assert_eq!(review.name(), "code_1");
    review.initialize("You review code.").unwrap();

    registry.reset_to_stage("debugging").unwrap();

    assert_eq!(code.len().unwrap(), 2);
    assert!(!registry.contains("code_1"));
    assert!(review.len().is_err());
}

/// Tests that the action log written by the observer replays to the same conversations.
///
/// # Panics
/// Panics if the log cannot be written or read.
#[test]
fn test_action_log_replays_to_identical_state() {
    let temp = TempDir::new().unwrap();
    let log_path = temp.path().join("actions.jsonl");

    let registry = ActionsAndConversations::new();
    registry.add_observer(Arc::new(ActionLogWriter::create(&log_path).unwrap()));
    let manager = ConversationManager::new(registry.clone(), "goal").unwrap();
    manager.initialize("system").unwrap();
    manager.append_user("request", Some("request")).unwrap();
    manager.append_assistant("first", None).unwrap();
    manager.append_user("feedback", None).unwrap();
    manager.append_assistant("second", None).unwrap();
    manager.comment("collapsing review").unwrap();
    manager
        .delete_range(&Position::tag_offset("request", 1), &Position::Index(-1))
        .unwrap();

    let replayed = ActionsAndConversations::new();
    for action in read_action_log(&log_path).unwrap() {
        replayed.apply(action).unwrap();
    }

    assert_eq!(
        replayed.snapshot("goal").unwrap(),
        registry.snapshot("goal").unwrap()
    );
    assert!(
        replayed
            .actions()
            .iter()
            .any(|action| matches!(action, Action::Comment { .. }))
    );
    assert_eq!(replayed.snapshot("goal").unwrap().len(), 3);
}
