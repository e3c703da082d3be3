use serde::{Deserialize, Serialize};

/// How much conversation history to discard or repost after an exchange.
///
/// The same policy applies to single-response validation failures and to the
/// end of a multi-round review, where it is scoped to the whole exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rewind {
    /// Delete the last response and request a new one, without feedback
    Regenerate,
    /// Delete every response since the request and start over
    Restart,
    /// Collapse the history to the request plus the last response posted as
    /// if it were the first answer, then append the feedback
    AsFresh,
    /// Keep everything and append the feedback
    Accumulate,
    /// Like [`Rewind::AsFresh`], and once the correction is accepted the
    /// corrected answer replaces the whole correction exchange
    AsFreshCorrection,
    /// Delete the whole exchange
    DeleteAll,
}

impl Rewind {
    /// Whether applying this policy posts a feedback message to the model.
    #[must_use]
    pub const fn posts_feedback(self) -> bool {
        matches!(
            self,
            Self::AsFresh | Self::Accumulate | Self::AsFreshCorrection
        )
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
    fn test_posts_feedback() {
        assert!(Rewind::Accumulate.posts_feedback());
        assert!(Rewind::AsFresh.posts_feedback());
        assert!(!Rewind::Regenerate.posts_feedback());
        assert!(!Rewind::DeleteAll.posts_feedback());
    }
}
