//! Event publishing for circuit breaker activity
//!
//! Consumers are plain closures registered on an [`EventPublisher`]. Publishing
//! is synchronous on the caller's thread, in registration order. With no
//! consumers registered nothing is built or allocated. A panicking consumer is
//! logged and skipped; it never reaches the caller or the other consumers.

use crate::state::{State, StateTransition};
use arc_swap::ArcSwap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A call was recorded as a success
    Success { elapsed: Duration },
    /// A call was recorded as a failure
    Error { elapsed: Duration, error: String },
    /// A call failed but its error was ignored
    IgnoredError { elapsed: Duration, error: String },
    /// A call was rejected
    NotPermitted,
    /// The breaker changed state
    StateTransition(StateTransition),
    /// The breaker was reset to a clean CLOSED state
    Reset,
    /// Failure rate reached its threshold
    FailureRateExceeded { rate: f32 },
    /// Slow-call rate reached its threshold
    SlowCallRateExceeded { rate: f32 },
}

/// An event emitted by a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitEvent {
    pub circuit_name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: EventKind,
}

impl CircuitEvent {
    /// Target state, if this is a transition event
    pub fn transition(&self) -> Option<StateTransition> {
        match self.kind {
            EventKind::StateTransition(transition) => Some(transition),
            _ => None,
        }
    }
}

/// Which events a consumer receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Success,
    Error,
    IgnoredError,
    NotPermitted,
    StateTransition,
    Reset,
    FailureRateExceeded,
    SlowCallRateExceeded,
    /// Successes and errors
    CallRecorded,
}

impl EventFilter {
    pub fn matches(&self, kind: &EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Success => matches!(kind, EventKind::Success { .. }),
            EventFilter::Error => matches!(kind, EventKind::Error { .. }),
            EventFilter::IgnoredError => matches!(kind, EventKind::IgnoredError { .. }),
            EventFilter::NotPermitted => matches!(kind, EventKind::NotPermitted),
            EventFilter::StateTransition => matches!(kind, EventKind::StateTransition(_)),
            EventFilter::Reset => matches!(kind, EventKind::Reset),
            EventFilter::FailureRateExceeded => {
                matches!(kind, EventKind::FailureRateExceeded { .. })
            }
            EventFilter::SlowCallRateExceeded => {
                matches!(kind, EventKind::SlowCallRateExceeded { .. })
            }
            EventFilter::CallRecorded => {
                matches!(kind, EventKind::Success { .. } | EventKind::Error { .. })
            }
        }
    }
}

type Consumer = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

struct Registration {
    id: u64,
    filter: EventFilter,
    consumer: Consumer,
}

struct Registry {
    name: Arc<str>,
    consumers: ArcSwap<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
}

/// Handle returned by every subscription
///
/// Dropping it keeps the consumer registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the consumer. Events already being published may still reach it.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.consumers.rcu(|current| {
                current
                    .iter()
                    .filter(|r| r.id != self.id)
                    .cloned()
                    .collect::<Vec<_>>()
            });
        }
    }
}

/// Ordered list of event consumers for one breaker
#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<Registry>,
}

impl EventPublisher {
    pub fn new(circuit_name: impl Into<Arc<str>>) -> Self {
        Self {
            registry: Arc::new(Registry {
                name: circuit_name.into(),
                consumers: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer for the events selected by `filter`
    pub fn subscribe<F>(&self, filter: EventFilter, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        let registration = Arc::new(Registration {
            id: self.registry.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            consumer: Arc::new(consumer),
        });
        let id = registration.id;

        self.registry.consumers.rcu(|current| {
            let mut next = current.to_vec();
            next.push(Arc::clone(&registration));
            next
        });

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn on_event<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::All, consumer)
    }

    pub fn on_success<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Success, consumer)
    }

    pub fn on_error<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Error, consumer)
    }

    pub fn on_ignored_error<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::IgnoredError, consumer)
    }

    pub fn on_call_not_permitted<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::NotPermitted, consumer)
    }

    pub fn on_state_transition<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::StateTransition, consumer)
    }

    pub fn on_reset<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Reset, consumer)
    }

    pub fn on_failure_rate_exceeded<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::FailureRateExceeded, consumer)
    }

    pub fn on_slow_call_rate_exceeded<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::SlowCallRateExceeded, consumer)
    }

    /// Successes and errors, the calls that reach the window
    pub fn on_call_recorded<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::CallRecorded, consumer)
    }

    /// Fire `consumer` with the circuit name whenever the breaker enters `state`
    pub(crate) fn on_enter<F>(&self, state: State, consumer: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_state_transition(move |event| {
            if event.transition().is_some_and(|t| t.to == state) {
                consumer(&*event.circuit_name);
            }
        })
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.consumers.load().len()
    }

    /// Publish the event built by `kind`, which only runs if someone is listening
    pub(crate) fn publish_with(&self, kind: impl FnOnce() -> EventKind) {
        let consumers = self.registry.consumers.load();
        if consumers.is_empty() {
            return;
        }

        let event = CircuitEvent {
            circuit_name: Arc::clone(&self.registry.name),
            created_at: SystemTime::now(),
            kind: kind(),
        };

        for registration in consumers.iter() {
            if !registration.filter.matches(&event.kind) {
                continue;
            }
            let consumer = &registration.consumer;
            if panic::catch_unwind(AssertUnwindSafe(|| consumer(&event))).is_err() {
                tracing::warn!(
                    circuit = %self.registry.name,
                    subscription = registration.id,
                    "Event consumer panicked; event skipped for this consumer"
                );
            }
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("circuit", &self.registry.name)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_without_consumers_does_not_build_event() {
        let publisher = EventPublisher::new("test");

        publisher.publish_with(|| panic!("event must not be built without consumers"));

        assert_eq!(publisher.consumer_count(), 0);
    }

    #[test]
    fn test_filters_route_events() {
        let publisher = EventPublisher::new("test");
        let successes = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let s = successes.clone();
        publisher.on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let r = recorded.clone();
        publisher.on_call_recorded(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let a = all.clone();
        publisher.on_event(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish_with(|| EventKind::Success {
            elapsed: Duration::from_millis(1),
        });
        publisher.publish_with(|| EventKind::Error {
            elapsed: Duration::from_millis(1),
            error: "boom".to_string(),
        });
        publisher.publish_with(|| EventKind::NotPermitted);

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(recorded.load(Ordering::SeqCst), 2);
        assert_eq!(all.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_consumers_run_in_registration_order() {
        let publisher = EventPublisher::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            publisher.on_event(move |_| order.lock().unwrap().push(i));
        }
        publisher.publish_with(|| EventKind::Reset);

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_consumer_is_isolated() {
        let publisher = EventPublisher::new("test");
        let reached = Arc::new(AtomicUsize::new(0));

        publisher.on_event(|_| panic!("consumer failure"));
        let r = reached.clone();
        publisher.on_event(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish_with(|| EventKind::Reset);
        publisher.publish_with(|| EventKind::Reset);

        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_removes_consumer() {
        let publisher = EventPublisher::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let subscription = publisher.on_reset(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        publisher.publish_with(|| EventKind::Reset);

        subscription.unsubscribe();
        publisher.publish_with(|| EventKind::Reset);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.consumer_count(), 0);
    }

    #[test]
    fn test_on_enter_matches_target_state() {
        let publisher = EventPublisher::new("payments");
        let opened = Arc::new(Mutex::new(Vec::new()));

        let o = opened.clone();
        publisher.on_enter(State::Open, move |name| o.lock().unwrap().push(name.to_string()));

        publisher.publish_with(|| {
            EventKind::StateTransition(StateTransition {
                from: State::Closed,
                to: State::Open,
            })
        });
        publisher.publish_with(|| {
            EventKind::StateTransition(StateTransition {
                from: State::Open,
                to: State::HalfOpen,
            })
        });

        assert_eq!(*opened.lock().unwrap(), vec!["payments".to_string()]);
    }
}
