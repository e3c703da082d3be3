//! LLM service clients.
//!
//! Every client implements [`paper_core::LlmClient`]; the wrappers compose,
//! so a live run typically stacks
//! `RecordingClient(RetryingClient(OpenAiProvider))`.

/// Scripted provider for tests.
pub mod mock;
/// OpenAI-compatible chat completions provider.
pub mod openai;
/// Call logs and record/replay clients.
pub mod recording;
/// Retry with exponential backoff.
pub mod retry;

pub use mock::ScriptedProvider;
pub use openai::OpenAiProvider;
pub use recording::{CallLog, LlmCallLog, RecordedCall, RecordingClient, ReplayClient};
pub use retry::RetryingClient;
