//! Single-shot deferred callbacks for automatic transitions
//!
//! A breaker schedules at most one timer per OPEN or HALF_OPEN episode and
//! cancels it when the episode ends. Timers that fire late are harmless: the
//! transition they trigger only succeeds if the episode that armed them is
//! still current.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Deferred work handed to a [`Scheduler`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules a task to run once after a delay
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `task` once after `delay` unless the returned handle is cancelled first
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    waker: OnceLock<Thread>,
}

/// Handle to a scheduled task
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running if it has not started yet
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let Some(thread) = self.state.waker.get() {
            thread.unpark();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler running each timer on its own parked thread
///
/// Cancelling wakes the thread so it exits immediately instead of sleeping
/// out the full delay.
///
/// Every OPEN or HALF_OPEN episode that needs a timer costs one OS thread for
/// the length of its wait. Applications running many breakers, or circuits
/// that flap, should share one [`Scheduler`] backed by their own timer
/// facility and pass it to each breaker:
///
/// ```rust
/// use sliding_breaker::{CircuitBreaker, ManualScheduler, State};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualScheduler::new());
/// let breakers: Vec<_> = ["billing", "search"]
///     .into_iter()
///     .map(|name| {
///         CircuitBreaker::builder(name)
///             .count_based_window(2)
///             .minimum_number_of_calls(2)
///             .wait_duration_in_open(Duration::from_secs(5))
///             .automatic_transition_to_half_open(true)
///             .scheduler(timers.clone())
///             .build()
///             .unwrap()
///     })
///     .collect();
///
/// for breaker in &breakers {
///     breaker.on_error(Duration::from_millis(1), &"down");
///     breaker.on_error(Duration::from_millis(1), &"down");
/// }
///
/// assert_eq!(timers.pending_delays().len(), 2);
/// assert_eq!(timers.run_pending(), 2);
/// assert!(breakers.iter().all(|b| b.state() == State::HalfOpen));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();

        let spawned = thread::Builder::new()
            .name("breaker-timer".to_string())
            .spawn(move || {
                let _ = timer.state.waker.set(thread::current());
                let deadline = Instant::now() + delay;
                loop {
                    if timer.is_cancelled() {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::park_timeout(deadline - now);
                }
                task();
            });

        if let Err(err) = spawned {
            tracing::warn!(error = %err, "Failed to spawn breaker timer thread; transition stays lazy");
        }
        handle
    }
}

struct PendingTask {
    delay: Duration,
    handle: TimerHandle,
    task: Task,
}

/// Scheduler that only runs tasks when told to
///
/// Pairs with [`ManualClock`](crate::ManualClock) for deterministic tests.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<PendingTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the tasks still waiting to run (cancelled ones excluded)
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.lock()
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .map(|p| p.delay)
            .collect()
    }

    /// Run every pending task that was not cancelled. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        // Tasks may schedule new timers, so run them outside the lock
        let drained: Vec<PendingTask> = self.lock().drain(..).collect();
        let mut ran = 0;
        for pending in drained {
            if !pending.handle.is_cancelled() {
                (pending.task)();
                ran += 1;
            }
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingTask>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        self.lock().push(PendingTask {
            delay,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending_delays().len())
            .finish()
    }
}
