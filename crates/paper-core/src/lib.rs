//! Core types and traits for the data-to-paper conversation engine.
//!
//! This crate provides the conversation store, the process-wide
//! [`ActionsAndConversations`] registry, the [`ConversationManager`] that
//! mediates every mutation, the LLM service contract, configuration and the
//! product types shared by the higher-level conversers.

/// Produced code together with its run output.
pub mod code_output;
/// Pipeline configuration loaded from TOML.
pub mod config;
/// Named, ordered message sequences.
pub mod conversation;
/// Error types and result definitions.
pub mod error;
/// LLM service contract and model tiers.
pub mod llm;
/// Conversation manager mediating all mutations.
pub mod manager;
/// Role-tagged messages.
pub mod message;
/// Observers mirroring conversation actions.
pub mod observer;
/// Typed product registry.
pub mod products;
/// Process-wide registry of conversations and actions.
pub mod registry;
/// History rewrite policies.
pub mod rewind;

pub use code_output::{CodeAndOutput, DataframeOperation};
pub use config::{
    CodeRevisionConfig, ConverserConfig, DebuggerConfig, HumanReviewMode, LlmConfig,
    PipelineConfig, RecordingConfig, RecordingMode, ReviewConfig,
};
pub use conversation::{Conversation, Position};
pub use error::{Error, Result};
pub use llm::{BumpModel, ChatMessage, LlmClient, LlmError, LlmRequest, LlmSettings, ModelEngine};
pub use manager::ConversationManager;
pub use message::{Message, Role};
pub use observer::{
    ActionLogWriter, ChannelObserver, ConversationObserver, TracingObserver, read_action_log,
};
pub use products::{CodeStep, ProductField, Products, Stage};
pub use registry::{Action, ActionsAndConversations, StageCheckpoint};
pub use rewind::Rewind;
