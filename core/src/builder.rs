//! Builder API for ergonomic circuit breaker configuration

use crate::{
    circuit::CircuitBreaker,
    classifier::{FailureClassifier, FailureContext, PredicateClassifier, ResultContext},
    clock::Clock,
    config::{Config, SlidingWindowType},
    errors::CircuitError,
    events::{CircuitEvent, EventPublisher},
    interval::WaitInterval,
    scheduler::Scheduler,
    state::State,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
///
/// Event hooks registered here are attached before the breaker exists, so they
/// see every event from the first call on.
pub struct CircuitBuilder {
    name: Arc<str>,
    config: Config,
    predicates: Option<PredicateClassifier>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    events: EventPublisher,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            events: EventPublisher::new(Arc::clone(&name)),
            name,
            config: Config::default(),
            predicates: None,
            clock: None,
            scheduler: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Failure percentage (0, 100] at or above which the circuit opens
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Slow-call percentage (0, 100] at or above which the circuit opens
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls at least this long count as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    /// Calls (count-based) or seconds (time-based)
    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Count-based window over the last `calls` calls
    pub fn count_based_window(self, calls: u32) -> Self {
        self.sliding_window_type(SlidingWindowType::CountBased)
            .sliding_window_size(calls)
    }

    /// Time-based window over the last `seconds` seconds
    pub fn time_based_window(self, seconds: u32) -> Self {
        self.sliding_window_type(SlidingWindowType::TimeBased)
            .sliding_window_size(seconds)
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    /// Fixed wait in OPEN before probing
    pub fn wait_duration_in_open(mut self, wait: Duration) -> Self {
        self.config.wait_interval = WaitInterval::fixed(wait);
        self
    }

    /// Wait in OPEN as a function of the backoff attempt
    pub fn wait_interval(mut self, interval: WaitInterval) -> Self {
        self.config.wait_interval = interval;
        self
    }

    /// Force the circuit open if trial calls have not completed in time.
    /// `Duration::ZERO` (the default) waits indefinitely.
    pub fn max_wait_in_half_open(mut self, max_wait: Duration) -> Self {
        self.config.max_wait_in_half_open = max_wait;
        self
    }

    /// Move from OPEN to HALF_OPEN on a timer rather than on the next request
    pub fn automatic_transition_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_to_half_open = enabled;
        self
    }

    /// Set a classifier deciding how errors and results are counted
    ///
    /// Replaces any predicates added with `record_error`, `ignore_error` or
    /// `record_result`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sliding_breaker::{CircuitBreaker, DefaultClassifier};
    /// use std::sync::Arc;
    ///
    /// let breaker = CircuitBreaker::builder("api")
    ///     .classifier(Arc::new(DefaultClassifier))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.classifier = classifier;
        self.predicates = None;
        self
    }

    /// Only errors matching `predicate` count as failures; others are successes
    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates = Some(self.predicates.unwrap_or_default().record_error(predicate));
        self
    }

    /// Errors matching `predicate` are not recorded at all
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sliding_breaker::CircuitBreaker;
    /// use std::time::Duration;
    ///
    /// let breaker = CircuitBreaker::builder("api")
    ///     .ignore_error(|ctx| ctx.error.downcast_ref::<u16>().is_some_and(|s| *s < 500))
    ///     .build()
    ///     .unwrap();
    ///
    /// breaker.on_error(Duration::from_millis(3), &404u16);
    /// assert_eq!(breaker.metrics().buffered_calls, 0);
    /// ```
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates = Some(self.predicates.unwrap_or_default().ignore_error(predicate));
        self
    }

    /// Results matching `predicate` count as failures
    pub fn record_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResultContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates = Some(self.predicates.unwrap_or_default().record_result(predicate));
        self
    }

    /// Time source (defaults to a monotonic clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Timer capability for automatic transitions (defaults to a thread per timer)
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_enter(State::Open, f);
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_enter(State::Closed, f);
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_enter(State::HalfOpen, f);
        self
    }

    /// Set callback for every state transition
    pub fn on_state_transition<F>(self, f: F) -> Self
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.events.on_state_transition(f);
        self
    }

    /// Validate the configuration and build the circuit breaker
    pub fn build(mut self) -> Result<CircuitBreaker, CircuitError> {
        if let Some(predicates) = self.predicates.take() {
            self.config.classifier = Arc::new(predicates);
        }

        CircuitBreaker::with_parts(
            self.name,
            self.config,
            self.clock,
            self.scheduler,
            self.events,
        )
    }
}
