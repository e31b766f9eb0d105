//! sliding-breaker - Lock-free circuit breaker driven by sliding-window metrics
//!
//! This crate provides a circuit breaker that never runs the guarded call
//! itself. Callers ask for permission, run the call, and report the outcome:
//! - Count-based and time-based sliding windows with lock-free atomic totals
//! - Six states (CLOSED, OPEN, HALF_OPEN, DISABLED, FORCED_OPEN, METRICS_ONLY)
//! - Failure-rate and slow-call-rate thresholds with a minimum-calls gate
//! - Pluggable outcome classification for errors and results
//! - Fixed, exponential and randomized backoff while open
//! - Synchronous event publishing with isolated consumers
//!
//! # Example
//!
//! ```rust
//! use sliding_breaker::{CircuitBreaker, State};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .count_based_window(10)
//!     .minimum_number_of_calls(4)
//!     .wait_duration_in_open(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! for _ in 0..4 {
//!     if breaker.try_acquire_permission() {
//!         breaker.on_error(Duration::from_millis(20), &"connection refused");
//!     }
//! }
//!
//! // Check circuit state
//! assert_eq!(breaker.state(), State::Open);
//! assert!(breaker.acquire_permission().is_err());
//! ```

pub mod builder;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod interval;
pub mod metrics;
pub mod permits;
pub mod scheduler;
pub mod state;
pub mod window;

pub use builder::CircuitBuilder;
pub use circuit::CircuitBreaker;
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier, ResultContext,
    Verdict,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, SlidingWindowType};
pub use errors::CircuitError;
pub use events::{CircuitEvent, EventFilter, EventKind, EventPublisher, Subscription};
pub use interval::WaitInterval;
pub use metrics::{Metrics, NOT_ENOUGH_DATA};
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TimerHandle};
pub use state::{State, StateTransition};
pub use window::{CountWindow, NullWindow, Outcome, SlidingWindow, Snapshot, TimeWindow};
