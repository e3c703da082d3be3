//! Library interface for paper-cli
//!
//! Exposes the command handlers and project loading for integration testing

/// Command-line argument definitions
pub mod cli;
/// Command handlers
pub mod handlers;
/// Project description
pub mod project;

pub use handlers::{RunArgs, build_llm_client, handle_config, handle_run, load_config};
pub use project::ProjectDescription;
