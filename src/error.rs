use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous rejection of an answer attempt. Nothing is mutated when one of
/// these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("question already answered correctly")]
    AlreadyCorrect,
    #[error("maximum attempts reached")]
    MaxAttemptsReached,
    #[error("invalid input")]
    InvalidInput,
}

impl RejectReason {
    /// Stable label used for metrics and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AlreadyCorrect => "already_correct",
            RejectReason::MaxAttemptsReached => "max_attempts_reached",
            RejectReason::InvalidInput => "invalid_input",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("attempt rejected: {0}")]
    Rejected(RejectReason),

    #[error("quiz {0} not found in catalog")]
    UnknownQuiz(String),

    #[error("question {0} not found in catalog")]
    UnknownQuestion(String),

    #[error("no session for quiz {0}")]
    SessionNotFound(String),

    /// Ephemeral CAS update kept conflicting past the retry budget.
    #[error("participant update for quiz {quiz_id} user {user_id} kept conflicting")]
    TransactionConflict { quiz_id: String, user_id: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            EngineError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_labels_are_stable() {
        assert_eq!(RejectReason::AlreadyCorrect.as_str(), "already_correct");
        assert_eq!(
            RejectReason::MaxAttemptsReached.as_str(),
            "max_attempts_reached"
        );
        assert_eq!(RejectReason::InvalidInput.as_str(), "invalid_input");
    }

    #[test]
    fn reject_reason_serializes_snake_case() {
        let json = serde_json::to_string(&RejectReason::MaxAttemptsReached).unwrap();
        assert_eq!(json, "\"max_attempts_reached\"");
    }
}
