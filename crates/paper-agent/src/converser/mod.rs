//! Single-conversation validation loop.
//!
//! A [`ResultConverser`] posts a request, extracts and checks every response
//! with a [`ResultChecker`], and rewrites the history according to the
//! [`paper_core::Rewind`] policy of each failure until a response is valid.

/// Reusable checkers.
pub mod checkers;
/// Structured content extraction from responses.
pub mod extract;
/// Validation failures and their recovery policy.
pub mod outcome;
/// The validation loop.
pub mod result;

pub use checkers::{FencedBlockChecker, JsonObjectChecker};
pub use extract::{
    CodeBlockError, FencedBlock, FencedBlocks, extract_code_block, extract_fenced_block,
    extract_json_object, is_bulleted_list, looks_truncated, parse_fenced_blocks,
};
pub use outcome::ValidationOutcome;
pub use result::{ConvergenceReport, ResultChecker, ResultConverser, ValidResult};
