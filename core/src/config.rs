//! Circuit breaker configuration and validation

use crate::classifier::{DefaultClassifier, FailureClassifier};
use crate::clock::Clock;
use crate::errors::CircuitError;
use crate::interval::WaitInterval;
use crate::window::{CountWindow, SlidingWindow, TimeWindow};
use std::sync::Arc;
use std::time::Duration;

/// How the closed-state window is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlidingWindowType {
    /// Last N calls
    #[default]
    CountBased,
    /// Calls from the last N seconds
    TimeBased,
}

/// Circuit breaker configuration
///
/// Immutable once handed to a breaker; every constructor runs [`Config::validate`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Failure percentage (0, 100] at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow-call percentage (0, 100] at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls taking at least this long count as slow
    pub slow_call_duration_threshold: Duration,

    /// Count-based or time-based window
    pub sliding_window_type: SlidingWindowType,

    /// Calls (count-based) or seconds (time-based) kept in the window
    pub sliding_window_size: u32,

    /// Calls required before the rates gate anything.
    /// For count-based windows the effective value is capped at the window size.
    pub minimum_number_of_calls: u32,

    /// Trial calls allowed while half-open
    pub permitted_calls_in_half_open: u32,

    /// Wait in Open before probing, as a function of the backoff attempt
    pub wait_interval: WaitInterval,

    /// Longest time to stay half-open before forcing the circuit open again.
    /// `Duration::ZERO` waits for the trial calls indefinitely.
    pub max_wait_in_half_open: Duration,

    /// Move from Open to HalfOpen on a timer instead of on the next permission request
    pub automatic_transition_to_half_open: bool,

    /// Decides whether errors and results count as failures, successes, or are ignored
    pub classifier: Arc<dyn FailureClassifier>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_calls_in_half_open: 10,
            wait_interval: WaitInterval::default(),
            max_wait_in_half_open: Duration::ZERO,
            automatic_transition_to_half_open: false,
            classifier: Arc::new(DefaultClassifier),
        }
    }
}

impl Config {
    /// Check every constraint, reporting the first violation
    pub fn validate(&self) -> Result<(), CircuitError> {
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;

        if self.slow_call_duration_threshold.is_zero() {
            return Err(CircuitError::invalid(
                "slow_call_duration_threshold",
                "must be greater than 0",
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(CircuitError::invalid(
                "sliding_window_size",
                "must be greater than 0",
            ));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(CircuitError::invalid(
                "minimum_number_of_calls",
                "must be greater than 0",
            ));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(CircuitError::invalid(
                "permitted_calls_in_half_open",
                "must be greater than 0",
            ));
        }
        self.wait_interval
            .check()
            .map_err(|reason| CircuitError::invalid("wait_interval", reason))
    }

    /// Minimum calls actually applied to the closed-state window
    pub fn effective_minimum_calls(&self) -> u64 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                u64::from(self.minimum_number_of_calls.min(self.sliding_window_size))
            }
            SlidingWindowType::TimeBased => u64::from(self.minimum_number_of_calls),
        }
    }

    /// Whether a call of this duration counts as slow
    pub fn is_slow(&self, duration: Duration) -> bool {
        duration >= self.slow_call_duration_threshold
    }

    /// Fresh closed-state window of the configured type
    pub(crate) fn new_window(&self, clock: &Arc<dyn Clock>) -> Arc<dyn SlidingWindow> {
        let size = self.sliding_window_size as usize;
        match self.sliding_window_type {
            SlidingWindowType::CountBased => Arc::new(CountWindow::new(size)),
            SlidingWindowType::TimeBased => Arc::new(TimeWindow::new(size, Arc::clone(clock))),
        }
    }
}

fn check_percentage(field: &'static str, value: f32) -> Result<(), CircuitError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(CircuitError::invalid(
            field,
            format!("must be in (0, 100], got {value}"),
        ))
    }
}
