//! Error taxonomy for alarm evaluation
//!
//! Errors fall into three classes that decide how the runner reacts:
//!
//! - **soft**: not enough data yet. Skipped silently, no notification.
//! - **user-facing**: the user's condition is broken. Surfaced as an `error`
//!   notification through the regular dispatch path.
//! - **internal**: storage or guard violations. Logged and swallowed at the
//!   per-alarm boundary so the scheduler keeps running.

use std::time::Duration;

use crate::storage::StorageError;

/// Result type alias for alarm operations
pub type AlarmResult<T> = Result<T, AlarmError>;

#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    /// Malformed user condition, reported at creation time
    #[error("invalid condition: {0}")]
    Parse(String),

    /// Fewer points than the trigger count are available
    #[error("alarm has not enough measurement points: need {needed}, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The expression could not be evaluated against the bound variables
    #[error("failed to evaluate alarm state: {0}")]
    Expression(#[from] ExpressionError),

    /// No retention policy covers the requested time range
    #[error("no retention policy covers a range of {requested:?}")]
    Range { requested: Duration },

    /// Store returned a different number of series than were requested
    #[error("mismatch of inputs and results: {expected} filters, {actual} series")]
    Consistency { expected: usize, actual: usize },

    /// Alarm is already fired, an open history entry exists
    #[error("alarm {0} not cleared yet, cannot fire before clearing the open event")]
    Conflict(String),

    /// No record (alarm, open history entry, output) found
    #[error("{0} not found")]
    NotFound(String),

    /// Alarm definition rejected before it reached storage
    #[error("invalid alarm: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AlarmError {
    /// Too few points yet. Never logged as an error and never notified.
    pub fn is_soft(&self) -> bool {
        matches!(self, AlarmError::InsufficientData { .. })
    }

    /// Errors the alarm owner can act on, dispatched as `error` events.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AlarmError::Parse(_) | AlarmError::Expression(_) | AlarmError::Validation(_)
        )
    }
}

/// Failure to compile or evaluate a boolean expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unexpected character '{found}' at position {position}")]
    UnexpectedCharacter { found: char, position: usize },

    #[error("unexpected token '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("no parameter '{0}' found")]
    UnknownVariable(String),

    #[error("cannot apply '{operator}' to {operand}")]
    TypeMismatch {
        operator: &'static str,
        operand: &'static str,
    },

    #[error("expression evaluated to a number, expected a boolean")]
    NotBoolean,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let soft = AlarmError::InsufficientData {
            needed: 5,
            available: 2,
        };
        assert!(soft.is_soft());
        assert!(!soft.is_user_facing());

        let expression = AlarmError::from(ExpressionError::NotBoolean);
        assert!(expression.is_user_facing());
        assert!(!expression.is_soft());

        let internal = AlarmError::Consistency {
            expected: 2,
            actual: 1,
        };
        assert!(!internal.is_user_facing());
        assert!(!internal.is_soft());

        assert!(!AlarmError::Conflict("a".into()).is_user_facing());
        assert!(!AlarmError::NotFound("a".into()).is_user_facing());
    }
}
