//! Conversers, review protocol and the code debugging state machine.
//!
//! This crate drives the LLM through the three loops of a code step:
//!
//! - **Result conversers**: request a response until it passes extraction and
//!   validation, rewinding the conversation on failure
//! - **Dual review**: a performer and a reviewer conversation advanced in strict
//!   alternation until the reviewer approves
//! - **Debugging**: run extracted code in a sandbox, classify what went wrong
//!   and repair the conversation according to a fixed action table
//!
//! # Architecture
//!
//! - [`converser`]: response validation and the rewind engine
//! - [`review`]: performer/reviewer dialog, including human reviewers
//! - [`code`]: issues, output requirements, static checks, sandboxes, the
//!   debugger and the code revision orchestrator
//! - [`prompts`]: prompt templates embedded from the `prompts/` directory

/// Code extraction, execution and repair
pub mod code;
/// Response validation and rewind engine
pub mod converser;
/// Embedded prompt templates
pub mod prompts;
/// Two-conversation review protocol
pub mod review;

pub use code::{
    CodeExecutor, CodeProblem, CodeRevisionOrchestrator, CodeRules, ContentCheck, Debugger,
    ExecutionFailure, OutputFileRequirement, OutputFileRequirements, PythonSandbox, RepairAction,
    RepairRecord, RunIssue, RunIssues, RunOutcome, RunRequest, run_static_checks,
    select_repair_action, trim_traceback,
};
pub use converser::{
    ConvergenceReport, ResultChecker, ResultConverser, ValidResult, ValidationOutcome,
};
pub use prompts::{load_prompt, render_prompt};
pub use review::{
    ChannelHumanReviewer, CycleStatus, DualConverser, HumanReviewer, ReviewState,
    classify_human_feedback, classify_reviewer_reply,
};
