//! Error types for circuit breaker operations

use crate::state::State;
use thiserror::Error;

/// Errors that can occur during circuit breaker operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitError {
    /// The breaker rejected the call (open, forced open, or half-open with no trial permits left)
    #[error("Circuit '{circuit}' does not permit further calls (state: {state})")]
    CallNotPermitted { circuit: String, state: State },

    /// A configuration value violated its constraint
    #[error("Invalid circuit breaker configuration: {field} {reason}")]
    ConfigValidation { field: &'static str, reason: String },
}

impl CircuitError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CircuitError::ConfigValidation {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a rejected call rather than a configuration problem
    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, CircuitError::CallNotPermitted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_not_permitted_display() {
        let err = CircuitError::CallNotPermitted {
            circuit: "payments".to_string(),
            state: State::ForcedOpen,
        };

        assert_eq!(
            err.to_string(),
            "Circuit 'payments' does not permit further calls (state: FORCED_OPEN)"
        );
        assert!(err.is_call_not_permitted());
    }

    #[test]
    fn test_config_validation_display() {
        let err = CircuitError::invalid("sliding_window_size", "must be greater than 0");

        assert_eq!(
            err.to_string(),
            "Invalid circuit breaker configuration: sliding_window_size must be greater than 0"
        );
        assert!(!err.is_call_not_permitted());
    }
}
