//! Circuit states and per-state evaluation
//!
//! Each state episode is a [`StateCell`] with its own rejection counter, timer
//! and, except for an OPEN episode the thresholds tripped, its own window. A
//! tripped OPEN episode keeps the window that tripped it so the metrics show
//! why the circuit opened. The breaker swaps whole cells, so calls still
//! finishing against a superseded cell never touch a fresh one. The methods
//! here only evaluate a cell; they never transition. The breaker turns their
//! answers into compare-and-swap transitions.

use crate::clock::{Clock, duration_nanos};
use crate::config::Config;
use crate::metrics::{Metrics, Rates};
use crate::permits::TrialPermits;
use crate::scheduler::TimerHandle;
use crate::window::{CountWindow, NullWindow, Outcome, SlidingWindow};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Operating state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls flow and outcomes are gated against the thresholds
    Closed,
    /// Calls are rejected until the wait interval elapses
    Open,
    /// A limited number of trial calls probe the downstream
    HalfOpen,
    /// Calls flow, nothing is recorded
    Disabled,
    /// Calls are rejected until a manual transition
    ForcedOpen,
    /// Calls flow and are recorded, thresholds never open the circuit
    MetricsOnly,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
            State::Disabled => "DISABLED",
            State::ForcedOpen => "FORCED_OPEN",
            State::MetricsOnly => "METRICS_ONLY",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, State::Open | State::ForcedOpen)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }

    /// Whether call events (success, error, rejection) are published in this state.
    /// Transition and reset events are always published.
    pub fn allows_publish(&self) -> bool {
        !matches!(self, State::Disabled | State::ForcedOpen)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change from one state to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateTransition {
    pub from: State,
    pub to: State,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Answer to a permission request against one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Permission {
    Granted,
    Denied,
    /// The cell's time is up; move to the given state and ask again
    Expired(State),
}

/// What a recorded outcome asks the breaker to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Next {
    /// Thresholds breached; open the circuit
    Open(Rates),
    /// Trial calls passed; close the circuit
    Close,
    /// Thresholds breached in METRICS_ONLY; report without transitioning
    Breached(Rates),
}

enum Phase {
    Closed,
    Open {
        retry_at: u64,
    },
    HalfOpen {
        permits: TrialPermits,
        deadline: Option<u64>,
    },
    Disabled,
    ForcedOpen,
    MetricsOnly {
        reported: AtomicBool,
    },
}

/// One state episode
pub(crate) struct StateCell {
    phase: Phase,
    attempts: u32,
    entered_at: u64,
    minimum_calls: u64,
    window: Arc<dyn SlidingWindow>,
    not_permitted: Arc<AtomicU64>,
    timer: OnceLock<TimerHandle>,
    failure_threshold: f32,
    slow_threshold: f32,
}

impl StateCell {
    /// Fresh episode of `state` entered at `now`
    ///
    /// `attempts` is the backoff attempt for OPEN; other states carry it so a
    /// failed probe can grow the next wait.
    pub(crate) fn enter(
        state: State,
        attempts: u32,
        now: u64,
        config: &Config,
        clock: &Arc<dyn Clock>,
    ) -> Self {
        let permitted = config.permitted_calls_in_half_open;
        let (phase, window, minimum_calls): (Phase, Arc<dyn SlidingWindow>, u64) = match state {
            State::Closed => (
                Phase::Closed,
                config.new_window(clock),
                config.effective_minimum_calls(),
            ),
            State::Open => {
                let wait = config.wait_interval.wait(attempts);
                (
                    Phase::Open {
                        retry_at: now.saturating_add(duration_nanos(wait)),
                    },
                    config.new_window(clock),
                    config.effective_minimum_calls(),
                )
            }
            State::HalfOpen => {
                let max_wait = config.max_wait_in_half_open;
                let deadline =
                    (!max_wait.is_zero()).then(|| now.saturating_add(duration_nanos(max_wait)));
                (
                    Phase::HalfOpen {
                        permits: TrialPermits::new(permitted),
                        deadline,
                    },
                    Arc::new(CountWindow::new(permitted as usize)),
                    u64::from(permitted),
                )
            }
            State::Disabled => (Phase::Disabled, Arc::new(NullWindow), 0),
            State::ForcedOpen => (
                Phase::ForcedOpen,
                config.new_window(clock),
                config.effective_minimum_calls(),
            ),
            State::MetricsOnly => (
                Phase::MetricsOnly {
                    reported: AtomicBool::new(false),
                },
                config.new_window(clock),
                config.effective_minimum_calls(),
            ),
        };

        Self {
            phase,
            attempts,
            entered_at: now,
            minimum_calls,
            window,
            not_permitted: Arc::new(AtomicU64::new(0)),
            timer: OnceLock::new(),
            failure_threshold: config.failure_rate_threshold,
            slow_threshold: config.slow_call_rate_threshold,
        }
    }

    /// OPEN episode tripped by `previous`, keeping its window and rejection count
    pub(crate) fn open_after(
        previous: &StateCell,
        attempts: u32,
        now: u64,
        config: &Config,
        clock: &Arc<dyn Clock>,
    ) -> Self {
        Self {
            window: Arc::clone(&previous.window),
            minimum_calls: previous.minimum_calls,
            not_permitted: Arc::clone(&previous.not_permitted),
            ..Self::enter(State::Open, attempts, now, config, clock)
        }
    }

    pub(crate) fn state(&self) -> State {
        match self.phase {
            Phase::Closed => State::Closed,
            Phase::Open { .. } => State::Open,
            Phase::HalfOpen { .. } => State::HalfOpen,
            Phase::Disabled => State::Disabled,
            Phase::ForcedOpen => State::ForcedOpen,
            Phase::MetricsOnly { .. } => State::MetricsOnly,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn entered_at(&self) -> u64 {
        self.entered_at
    }

    pub(crate) fn try_acquire(&self, now: u64) -> Permission {
        match &self.phase {
            Phase::Closed | Phase::Disabled | Phase::MetricsOnly { .. } => Permission::Granted,
            Phase::ForcedOpen => Permission::Denied,
            Phase::Open { retry_at } => {
                if now >= *retry_at {
                    Permission::Expired(State::HalfOpen)
                } else {
                    Permission::Denied
                }
            }
            Phase::HalfOpen { permits, deadline } => {
                if deadline.is_some_and(|d| now >= d) {
                    Permission::Expired(State::Open)
                } else if permits.try_acquire() {
                    Permission::Granted
                } else {
                    Permission::Denied
                }
            }
        }
    }

    /// Give back a permission that was granted but not used
    pub(crate) fn release(&self) {
        if let Phase::HalfOpen { permits, .. } = &self.phase {
            permits.release();
        }
    }

    pub(crate) fn reject(&self) -> u64 {
        self.not_permitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a completed call and report what the breaker should do
    pub(crate) fn record(&self, outcome: Outcome, now: u64) -> Option<Next> {
        match &self.phase {
            Phase::Disabled => None,
            // Stragglers admitted before the circuit opened
            Phase::Open { .. } | Phase::ForcedOpen => {
                self.window.record(outcome);
                None
            }
            Phase::Closed => {
                let rates = Rates::of(&self.window.record(outcome), self.minimum_calls);
                self.breached(&rates).then_some(Next::Open(rates))
            }
            Phase::HalfOpen { deadline, .. } => {
                let snapshot = self.window.record(outcome);
                if deadline.is_some_and(|d| now >= d) {
                    return Some(Next::Open(Rates::of(&snapshot, self.minimum_calls)));
                }
                if snapshot.total_calls < self.minimum_calls {
                    return None;
                }
                let rates = Rates::of(&snapshot, self.minimum_calls);
                if self.breached(&rates) {
                    Some(Next::Open(rates))
                } else {
                    Some(Next::Close)
                }
            }
            Phase::MetricsOnly { reported } => {
                let rates = Rates::of(&self.window.record(outcome), self.minimum_calls);
                if self.breached(&rates) && !reported.swap(true, Ordering::AcqRel) {
                    Some(Next::Breached(rates))
                } else {
                    None
                }
            }
        }
    }

    fn breached(&self, rates: &Rates) -> bool {
        rates.failure_exceeds(self.failure_threshold) || rates.slow_exceeds(self.slow_threshold)
    }

    pub(crate) fn failure_threshold(&self) -> f32 {
        self.failure_threshold
    }

    pub(crate) fn slow_threshold(&self) -> f32 {
        self.slow_threshold
    }

    pub(crate) fn metrics(&self) -> Metrics {
        Metrics::new(
            &self.window.snapshot(),
            self.minimum_calls,
            self.not_permitted.load(Ordering::Relaxed),
        )
    }

    /// When this cell's scheduled work is due and what it moves to
    pub(crate) fn timer_target(&self, automatic_half_open: bool) -> Option<(u64, State)> {
        match &self.phase {
            Phase::Open { retry_at } if automatic_half_open => Some((*retry_at, State::HalfOpen)),
            Phase::HalfOpen {
                deadline: Some(deadline),
                ..
            } => Some((*deadline, State::Open)),
            _ => None,
        }
    }

    pub(crate) fn arm(&self, handle: TimerHandle) {
        if let Err(handle) = self.timer.set(handle) {
            tracing::warn!(state = %self.state(), "State already had a timer; cancelling the new one");
            handle.cancel();
        }
    }

    pub(crate) fn disarm(&self) {
        if let Some(handle) = self.timer.get() {
            handle.cancel();
        }
    }

    #[cfg(test)]
    fn available_permits(&self) -> Option<u32> {
        match &self.phase {
            Phase::HalfOpen { permits, .. } => Some(permits.available()),
            _ => None,
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("state", &self.state())
            .field("attempts", &self.attempts)
            .field("entered_at", &self.entered_at)
            .field("window", &self.window)
            .finish()
    }
}

/// Backoff attempt carried into `to` when leaving a cell in `from` state
///
/// Opening from CLOSED starts at 1, a failed probe adds one, and HALF_OPEN
/// keeps the attempt of the episode it probes. Manual transitions start over.
pub(crate) fn attempts_on_entry(from: State, from_attempts: u32, to: State, manual: bool) -> u32 {
    match to {
        State::Open if manual => 1,
        State::Open => match from {
            State::HalfOpen => from_attempts.saturating_add(1),
            _ => from_attempts.max(1),
        },
        State::HalfOpen if manual => 1,
        State::HalfOpen => from_attempts.max(1),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::interval::WaitInterval;
    use std::time::Duration;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new())
    }

    fn small_config() -> Config {
        Config {
            sliding_window_size: 5,
            minimum_number_of_calls: 2,
            permitted_calls_in_half_open: 2,
            wait_interval: WaitInterval::fixed(Duration::from_secs(10)),
            slow_call_duration_threshold: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn fast_success() -> Outcome {
        Outcome::success(Duration::from_millis(5), false)
    }

    fn fast_failure() -> Outcome {
        Outcome::failure(Duration::from_millis(5), false)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Closed.to_string(), "CLOSED");
        assert_eq!(State::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(State::MetricsOnly.to_string(), "METRICS_ONLY");
        assert_eq!(
            StateTransition {
                from: State::Closed,
                to: State::Open
            }
            .to_string(),
            "CLOSED -> OPEN"
        );
    }

    #[test]
    fn test_state_helpers() {
        assert!(State::Open.is_open());
        assert!(State::ForcedOpen.is_open());
        assert!(!State::HalfOpen.is_open());
        assert!(State::Closed.is_closed());
        assert!(!State::Disabled.allows_publish());
        assert!(!State::ForcedOpen.allows_publish());
        assert!(State::MetricsOnly.allows_publish());
    }

    #[test]
    fn test_closed_trips_at_threshold() {
        let cell = StateCell::enter(State::Closed, 0, 0, &small_config(), &clock());

        assert_eq!(cell.try_acquire(0), Permission::Granted);
        assert_eq!(cell.record(fast_success(), 0), None);

        match cell.record(fast_failure(), 0) {
            Some(Next::Open(rates)) => assert_eq!(rates.failure, 50.0),
            other => panic!("Expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_closed_trips_on_slow_rate() {
        let config = Config {
            slow_call_rate_threshold: 50.0,
            ..small_config()
        };
        let cell = StateCell::enter(State::Closed, 0, 0, &config, &clock());

        cell.record(Outcome::success(Duration::from_secs(2), true), 0);
        match cell.record(fast_success(), 0) {
            Some(Next::Open(rates)) => {
                assert_eq!(rates.slow, 50.0);
                assert_eq!(rates.failure, 0.0);
            }
            other => panic!("Expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_open_denies_until_wait_elapses() {
        let cell = StateCell::enter(State::Open, 1, 100, &small_config(), &clock());
        let wait = duration_nanos(Duration::from_secs(10));

        assert_eq!(cell.try_acquire(100), Permission::Denied);
        assert_eq!(cell.try_acquire(100 + wait - 1), Permission::Denied);
        assert_eq!(
            cell.try_acquire(100 + wait),
            Permission::Expired(State::HalfOpen)
        );
    }

    #[test]
    fn test_half_open_permits_and_close() {
        let cell = StateCell::enter(State::HalfOpen, 1, 0, &small_config(), &clock());

        assert_eq!(cell.try_acquire(0), Permission::Granted);
        assert_eq!(cell.try_acquire(0), Permission::Granted);
        assert_eq!(cell.try_acquire(0), Permission::Denied);
        assert_eq!(cell.available_permits(), Some(0));

        assert_eq!(cell.record(fast_success(), 0), None);
        assert_eq!(cell.record(fast_success(), 0), Some(Next::Close));
    }

    #[test]
    fn test_half_open_reopens_on_failures() {
        let cell = StateCell::enter(State::HalfOpen, 1, 0, &small_config(), &clock());

        assert_eq!(cell.record(fast_success(), 0), None);
        assert!(matches!(cell.record(fast_failure(), 0), Some(Next::Open(_))));
    }

    #[test]
    fn test_half_open_release_returns_permit() {
        let cell = StateCell::enter(State::HalfOpen, 1, 0, &small_config(), &clock());

        assert_eq!(cell.try_acquire(0), Permission::Granted);
        cell.release();
        assert_eq!(cell.available_permits(), Some(2));
    }

    #[test]
    fn test_half_open_deadline() {
        let config = Config {
            max_wait_in_half_open: Duration::from_secs(5),
            ..small_config()
        };
        let cell = StateCell::enter(State::HalfOpen, 1, 0, &config, &clock());
        let deadline = duration_nanos(Duration::from_secs(5));

        assert_eq!(cell.try_acquire(deadline - 1), Permission::Granted);
        assert_eq!(cell.try_acquire(deadline), Permission::Expired(State::Open));
        assert!(matches!(
            cell.record(fast_success(), deadline),
            Some(Next::Open(_))
        ));
        assert_eq!(cell.timer_target(false), Some((deadline, State::Open)));
    }

    #[test]
    fn test_forced_open_and_disabled() {
        let forced = StateCell::enter(State::ForcedOpen, 0, 0, &small_config(), &clock());
        assert_eq!(forced.try_acquire(u64::MAX), Permission::Denied);
        assert_eq!(forced.record(fast_failure(), 0), None);
        assert_eq!(forced.record(fast_failure(), 0), None);

        let disabled = StateCell::enter(State::Disabled, 0, 0, &small_config(), &clock());
        assert_eq!(disabled.try_acquire(0), Permission::Granted);
        assert_eq!(disabled.record(fast_failure(), 0), None);
        assert_eq!(disabled.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_metrics_only_reports_breach_once() {
        let cell = StateCell::enter(State::MetricsOnly, 0, 0, &small_config(), &clock());

        assert_eq!(cell.record(fast_failure(), 0), None);
        assert!(matches!(
            cell.record(fast_failure(), 0),
            Some(Next::Breached(_))
        ));
        assert_eq!(cell.record(fast_failure(), 0), None);
        assert_eq!(cell.metrics().failed_calls, 3);
    }

    #[test]
    fn test_rejections_counted_per_cell() {
        let cell = StateCell::enter(State::Open, 1, 0, &small_config(), &clock());

        assert_eq!(cell.reject(), 1);
        assert_eq!(cell.reject(), 2);
        assert_eq!(cell.metrics().not_permitted_calls, 2);
    }

    #[test]
    fn test_open_after_shares_tripping_window() {
        let (config, clock) = (small_config(), clock());
        let closed = StateCell::enter(State::Closed, 0, 0, &config, &clock);
        closed.record(fast_success(), 0);
        assert!(matches!(closed.record(fast_failure(), 0), Some(Next::Open(_))));

        let open = StateCell::open_after(&closed, 1, 0, &config, &clock);
        let metrics = open.metrics();
        assert_eq!(open.state(), State::Open);
        assert_eq!(metrics.buffered_calls, 2);
        assert_eq!(metrics.failure_rate, 50.0);

        // Late outcomes land in the shared window without deciding anything
        assert_eq!(open.record(fast_failure(), 0), None);
        assert_eq!(closed.metrics().buffered_calls, 3);
        open.reject();
        assert_eq!(closed.metrics().not_permitted_calls, 1);
    }

    #[test]
    fn test_timer_target_only_when_automatic() {
        let cell = StateCell::enter(State::Open, 1, 0, &small_config(), &clock());

        assert_eq!(cell.timer_target(false), None);
        assert_eq!(
            cell.timer_target(true),
            Some((duration_nanos(Duration::from_secs(10)), State::HalfOpen))
        );
    }

    #[test]
    fn test_attempts_on_entry() {
        assert_eq!(attempts_on_entry(State::Closed, 0, State::Open, false), 1);
        assert_eq!(attempts_on_entry(State::Open, 1, State::HalfOpen, false), 1);
        assert_eq!(attempts_on_entry(State::HalfOpen, 1, State::Open, false), 2);
        assert_eq!(attempts_on_entry(State::HalfOpen, 4, State::Open, false), 5);
        assert_eq!(attempts_on_entry(State::HalfOpen, 4, State::Closed, false), 0);
        assert_eq!(attempts_on_entry(State::HalfOpen, 4, State::Open, true), 1);
        assert_eq!(attempts_on_entry(State::Open, 3, State::HalfOpen, true), 1);
        assert_eq!(attempts_on_entry(State::Open, 3, State::ForcedOpen, true), 0);
    }
}
