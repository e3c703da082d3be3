//! Code extraction, execution and repair.
//!
//! Submitted code flows through [`static_checks`], a [`sandbox::CodeExecutor`]
//! and the [`requirements`] on its output files. Every problem becomes a
//! [`RunIssue`]; the [`debugger`] turns the most severe one into a repair of
//! the conversation, and the [`revision`] orchestrator drives a whole code
//! step through writing, output review and explanation.

pub mod debugger;
pub mod issues;
pub mod python;
pub mod requirements;
pub mod revision;
pub mod sandbox;
pub mod static_checks;

pub use debugger::{Debugger, RepairAction, RepairRecord, fresh_code_response, select_repair_action};
pub use issues::{CodeProblem, RunIssue, RunIssues, trim_traceback};
pub use python::PythonSandbox;
pub use requirements::{ContentCheck, OutputFileRequirement, OutputFileRequirements};
pub use revision::CodeRevisionOrchestrator;
pub use sandbox::{CodeExecutor, ExecutionFailure, RunOutcome, RunRequest};
pub use static_checks::{CodeRules, check_small_change, run_static_checks};
