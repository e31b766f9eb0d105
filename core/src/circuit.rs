//! Circuit breaker implementation
//!
//! The current state episode lives behind an [`ArcSwap`]. Reads are a single
//! atomic load; transitions build the next episode and install it with
//! `compare_and_swap`. Only the thread whose swap succeeds cancels the old
//! episode's timer, arms the new one, logs and publishes the transition.

use crate::builder::CircuitBuilder;
use crate::classifier::{FailureContext, ResultContext, Verdict};
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::errors::CircuitError;
use crate::events::{EventKind, EventPublisher};
use crate::metrics::{Metrics, Rates};
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::state::{Next, Permission, State, StateCell, StateTransition, attempts_on_entry};
use crate::window::Outcome;
use arc_swap::ArcSwap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Inner {
    name: Arc<str>,
    config: Config,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn Scheduler>>,
    events: EventPublisher,
    cell: ArcSwap<StateCell>,
}

/// Circuit breaker guarding calls to one downstream dependency
///
/// Cloning is cheap and every clone shares the same state. The breaker never
/// runs the guarded call itself; callers ask for permission, run the call and
/// report how it went:
///
/// ```rust
/// use sliding_breaker::CircuitBreaker;
/// use std::time::Instant;
///
/// let breaker = CircuitBreaker::builder("inventory")
///     .failure_rate_threshold(50.0)
///     .sliding_window_size(10)
///     .minimum_number_of_calls(5)
///     .build()
///     .unwrap();
///
/// if breaker.try_acquire_permission() {
///     let start = Instant::now();
///     let result: Result<u32, String> = Ok(3);
///     match result {
///         Ok(value) => breaker.on_result(start.elapsed(), &value),
///         Err(err) => breaker.on_error(start.elapsed(), &err),
///     }
/// }
/// assert!(breaker.state().is_closed());
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration and a monotonic clock
    pub fn new(name: impl Into<Arc<str>>, config: Config) -> Result<Self, CircuitError> {
        let name = name.into();
        let events = EventPublisher::new(Arc::clone(&name));
        Self::with_parts(name, config, None, None, events)
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<Arc<str>>) -> CircuitBuilder {
        CircuitBuilder::new(name)
    }

    /// Assemble a breaker (used by the builder)
    pub(crate) fn with_parts(
        name: Arc<str>,
        config: Config,
        clock: Option<Arc<dyn Clock>>,
        scheduler: Option<Arc<dyn Scheduler>>,
        events: EventPublisher,
    ) -> Result<Self, CircuitError> {
        config.validate()?;

        let clock = clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let scheduler = scheduler.or_else(|| {
            let needs_timer = config.automatic_transition_to_half_open
                || !config.max_wait_in_half_open.is_zero();
            needs_timer.then(|| Arc::new(ThreadScheduler) as Arc<dyn Scheduler>)
        });
        let initial = StateCell::enter(State::Closed, 0, clock.now_nanos(), &config, &clock);

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                config,
                clock,
                scheduler,
                events,
                cell: ArcSwap::from_pointee(initial),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> State {
        self.inner.cell.load().state()
    }

    /// Metrics of the current state episode
    pub fn metrics(&self) -> Metrics {
        self.inner.cell.load().metrics()
    }

    /// Publisher for subscribing to this breaker's events
    pub fn event_publisher(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Ask whether a call may proceed
    ///
    /// Never blocks. A granted permission must be followed by exactly one of
    /// [`on_success`](Self::on_success), [`on_error`](Self::on_error),
    /// [`on_result`](Self::on_result) or [`release_permission`](Self::release_permission).
    pub fn try_acquire_permission(&self) -> bool {
        loop {
            let cell = self.inner.cell.load_full();
            match cell.try_acquire(self.now()) {
                Permission::Granted => return true,
                Permission::Denied => {
                    let rejected = cell.reject();
                    tracing::debug!(
                        circuit = %self.inner.name,
                        state = %cell.state(),
                        rejected,
                        "Call not permitted"
                    );
                    if cell.state().allows_publish() {
                        self.inner.events.publish_with(|| EventKind::NotPermitted);
                    }
                    return false;
                }
                Permission::Expired(target) => {
                    self.transition(&cell, target, false, None);
                }
            }
        }
    }

    /// Like [`try_acquire_permission`](Self::try_acquire_permission) but
    /// reports a rejection as [`CircuitError::CallNotPermitted`]
    pub fn acquire_permission(&self) -> Result<(), CircuitError> {
        if self.try_acquire_permission() {
            Ok(())
        } else {
            Err(CircuitError::CallNotPermitted {
                circuit: self.inner.name.to_string(),
                state: self.state(),
            })
        }
    }

    /// Return a permission that was granted but not used
    pub fn release_permission(&self) {
        self.inner.cell.load().release();
    }

    /// Record a successful call
    pub fn on_success(&self, duration: Duration) {
        self.record(Outcome::success(duration, self.inner.config.is_slow(duration)), || {
            EventKind::Success { elapsed: duration }
        });
    }

    /// Record a call that failed with `error`
    ///
    /// The configured classifier decides whether the error counts as a failure,
    /// as a success, or is ignored. Ignored errors are not recorded and hand
    /// their permission back.
    pub fn on_error<E: Any + fmt::Debug>(&self, duration: Duration, error: &E) {
        let ctx = FailureContext {
            circuit_name: &self.inner.name,
            error: error as &dyn Any,
            duration,
        };
        let slow = self.inner.config.is_slow(duration);

        match self.inner.config.classifier.classify_error(&ctx) {
            Verdict::Failure => self.record(Outcome::failure(duration, slow), || EventKind::Error {
                elapsed: duration,
                error: format!("{error:?}"),
            }),
            Verdict::Success => self.record(Outcome::success(duration, slow), || {
                EventKind::Success { elapsed: duration }
            }),
            Verdict::Ignored => self.ignore(|| EventKind::IgnoredError {
                elapsed: duration,
                error: format!("{error:?}"),
            }),
        }
    }

    /// Record a call that returned `result`
    ///
    /// Results are successes unless the classifier marks them as failures.
    pub fn on_result<T: Any>(&self, duration: Duration, result: &T) {
        let ctx = ResultContext {
            circuit_name: &self.inner.name,
            result: result as &dyn Any,
            duration,
        };
        let slow = self.inner.config.is_slow(duration);

        match self.inner.config.classifier.classify_result(&ctx) {
            Verdict::Success => self.record(Outcome::success(duration, slow), || {
                EventKind::Success { elapsed: duration }
            }),
            Verdict::Failure => self.record(Outcome::failure(duration, slow), || EventKind::Error {
                elapsed: duration,
                error: "result classified as failure".to_string(),
            }),
            Verdict::Ignored => self.ignore(|| EventKind::IgnoredError {
                elapsed: duration,
                error: "result ignored".to_string(),
            }),
        }
    }

    pub fn transition_to_closed_state(&self) {
        self.force(State::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.force(State::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.force(State::HalfOpen);
    }

    pub fn transition_to_disabled_state(&self) {
        self.force(State::Disabled);
    }

    pub fn transition_to_forced_open_state(&self) {
        self.force(State::ForcedOpen);
    }

    pub fn transition_to_metrics_only_state(&self) {
        self.force(State::MetricsOnly);
    }

    /// Return to CLOSED with an empty window, from any state
    pub fn reset(&self) {
        let now = self.now();
        let fresh = Arc::new(StateCell::enter(
            State::Closed,
            0,
            now,
            &self.inner.config,
            &self.inner.clock,
        ));
        let previous = self.inner.cell.swap(fresh);
        previous.disarm();

        let from = previous.state();
        tracing::info!(circuit = %self.inner.name, from = %from, "Circuit breaker reset");
        if from != State::Closed {
            self.inner.events.publish_with(|| {
                EventKind::StateTransition(StateTransition {
                    from,
                    to: State::Closed,
                })
            });
        }
        self.inner.events.publish_with(|| EventKind::Reset);
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_nanos()
    }

    fn record(&self, outcome: Outcome, event: impl FnOnce() -> EventKind) {
        let cell = self.inner.cell.load_full();
        let next = cell.record(outcome, self.now());

        if cell.state().allows_publish() {
            self.inner.events.publish_with(event);
        }

        match next {
            None => {}
            Some(Next::Open(rates)) => {
                self.transition(&cell, State::Open, false, Some(rates));
            }
            Some(Next::Close) => {
                self.transition(&cell, State::Closed, false, None);
            }
            Some(Next::Breached(rates)) => {
                tracing::debug!(
                    circuit = %self.inner.name,
                    failure_rate = rates.failure,
                    slow_call_rate = rates.slow,
                    "Thresholds exceeded in METRICS_ONLY; staying put"
                );
                self.report_breach(&cell, rates);
            }
        }
    }

    fn report_breach(&self, cell: &StateCell, rates: Rates) {
        if rates.failure_exceeds(cell.failure_threshold()) {
            self.inner.events.publish_with(|| EventKind::FailureRateExceeded {
                rate: rates.failure,
            });
        }
        if rates.slow_exceeds(cell.slow_threshold()) {
            self.inner.events.publish_with(|| EventKind::SlowCallRateExceeded {
                rate: rates.slow,
            });
        }
    }

    fn ignore(&self, event: impl FnOnce() -> EventKind) {
        let cell = self.inner.cell.load();
        cell.release();
        if cell.state().allows_publish() {
            self.inner.events.publish_with(event);
        }
    }

    /// Manual transition: retry until this call's swap wins
    fn force(&self, to: State) {
        loop {
            let current = self.inner.cell.load_full();
            if self.transition(&current, to, true, None) {
                return;
            }
        }
    }

    /// Replace `current` with a new episode of `to`, unless someone else
    /// replaced it first. Returns whether this call won.
    ///
    /// `breach` carries the rates that tripped the circuit; they are reported
    /// by the winner only.
    fn transition(
        &self,
        current: &Arc<StateCell>,
        to: State,
        manual: bool,
        breach: Option<Rates>,
    ) -> bool {
        let from = current.state();
        let now = self.now();
        let attempts = attempts_on_entry(from, current.attempts(), to, manual);
        let (config, clock) = (&self.inner.config, &self.inner.clock);
        let next = Arc::new(if to == State::Open && !manual {
            StateCell::open_after(current, attempts, now, config, clock)
        } else {
            StateCell::enter(to, attempts, now, config, clock)
        });

        let previous = self.inner.cell.compare_and_swap(current, Arc::clone(&next));
        if !Arc::ptr_eq(&previous, current) {
            return false;
        }

        current.disarm();
        self.arm(&next, now);

        tracing::info!(
            circuit = %self.inner.name,
            from = %from,
            to = %to,
            attempt = attempts,
            in_previous_state_ms = now.saturating_sub(current.entered_at()) / 1_000_000,
            manual,
            "Circuit breaker state transition"
        );
        if let Some(rates) = breach {
            self.report_breach(current, rates);
        }
        self.inner
            .events
            .publish_with(|| EventKind::StateTransition(StateTransition { from, to }));
        true
    }

    /// Schedule the cell's timed transition, if it has one
    fn arm(&self, cell: &Arc<StateCell>, now: u64) {
        let Some(scheduler) = &self.inner.scheduler else {
            return;
        };
        let Some((due_at, target)) =
            cell.timer_target(self.inner.config.automatic_transition_to_half_open)
        else {
            return;
        };

        let breaker: Weak<Inner> = Arc::downgrade(&self.inner);
        let expected: Weak<StateCell> = Arc::downgrade(cell);
        let delay = Duration::from_nanos(due_at.saturating_sub(now));

        let handle = scheduler.schedule(
            delay,
            Box::new(move || {
                let (Some(inner), Some(expected)) = (breaker.upgrade(), expected.upgrade()) else {
                    return;
                };
                CircuitBreaker { inner }.transition(&expected, target, false, None);
            }),
        );
        cell.arm(handle);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .field("events", &self.inner.events)
            .finish()
    }
}
