use paper_core::{BumpModel, Rewind};
use thiserror::Error;

/// A response that failed extraction or validation, with instructions on how
/// to recover.
///
/// Unset `rewind` and `bump_model` fields are filled in by the converser
/// depending on whether the failure happened during extraction or validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{title}: {message}")]
pub struct ValidationOutcome {
    /// Short heading of the feedback message
    pub title: String,
    /// What is wrong with the response
    pub message: String,
    /// How the response should be formatted
    pub formatting_instructions: Option<String>,
    /// History rewrite to apply before retrying
    pub rewind: Option<Rewind>,
    /// Model escalation to apply before retrying
    pub bump_model: Option<BumpModel>,
    /// Change to the remaining iteration budget
    pub add_iterations: i32,
    /// Whether the last response should be replaced by its fresh-looking form
    pub rewrite_as_fresh: bool,
}

impl ValidationOutcome {
    /// Creates an outcome with default recovery.
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            formatting_instructions: None,
            rewind: None,
            bump_model: None,
            add_iterations: 0,
            rewrite_as_fresh: false,
        }
    }

    /// Sets formatting instructions appended to the feedback.
    #[must_use]
    pub fn with_formatting_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.formatting_instructions = Some(instructions.into());
        self
    }

    /// Sets the rewind policy.
    #[must_use]
    pub const fn with_rewind(mut self, rewind: Rewind) -> Self {
        self.rewind = Some(rewind);
        self
    }

    /// Sets the model escalation.
    #[must_use]
    pub const fn with_bump_model(mut self, bump_model: BumpModel) -> Self {
        self.bump_model = Some(bump_model);
        self
    }

    /// Grants (or takes away) iterations.
    #[must_use]
    pub const fn with_add_iterations(mut self, add_iterations: i32) -> Self {
        self.add_iterations = add_iterations;
        self
    }

    /// Replaces the last response with its fresh-looking form before the feedback.
    #[must_use]
    pub const fn rewriting_as_fresh(mut self) -> Self {
        self.rewrite_as_fresh = true;
        self
    }

    /// Feedback message posted to the model.
    pub fn feedback_message(&self) -> String {
        let mut feedback = format!("# {}\n{}", self.title, self.message.trim_end());
        if let Some(instructions) = &self.formatting_instructions {
            feedback.push_str("\n\n");
            feedback.push_str(instructions.trim_end());
        }
        feedback
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::assertions_on_result_states,
    reason = "Tests unwrap and assert on results directly"
)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_message() {
        let outcome = ValidationOutcome::new("Wrong format", "No JSON object found.")
            .with_formatting_instructions("Reply with a single ```json block.");
        assert_eq!(
            outcome.feedback_message(),
            "# Wrong format\nNo JSON object found.\n\nReply with a single ```json block."
        );
        assert_eq!(outcome.to_string(), "Wrong format: No JSON object found.");
    }
}
