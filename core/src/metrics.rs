//! Rate derivation and the read-only metrics view

use crate::window::Snapshot;
use std::time::Duration;

/// Rate reported while the window holds fewer calls than the minimum
pub const NOT_ENOUGH_DATA: f32 = -1.0;

/// Percentage of failed calls, or [`NOT_ENOUGH_DATA`] below `minimum_calls`
pub fn failure_rate(snapshot: &Snapshot, minimum_calls: u64) -> f32 {
    percentage(snapshot.failed_calls, snapshot.total_calls, minimum_calls)
}

/// Percentage of slow calls, or [`NOT_ENOUGH_DATA`] below `minimum_calls`
pub fn slow_call_rate(snapshot: &Snapshot, minimum_calls: u64) -> f32 {
    percentage(snapshot.slow_calls, snapshot.total_calls, minimum_calls)
}

fn percentage(part: u64, total: u64, minimum_calls: u64) -> f32 {
    if total == 0 || total < minimum_calls {
        return NOT_ENOUGH_DATA;
    }
    (part as f64 * 100.0 / total as f64) as f32
}

/// Both gating rates for one snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Rates {
    pub failure: f32,
    pub slow: f32,
}

impl Rates {
    pub(crate) fn of(snapshot: &Snapshot, minimum_calls: u64) -> Self {
        Self {
            failure: failure_rate(snapshot, minimum_calls),
            slow: slow_call_rate(snapshot, minimum_calls),
        }
    }

    /// Whether enough calls were seen to judge at all
    pub(crate) fn is_measured(&self) -> bool {
        self.failure != NOT_ENOUGH_DATA
    }

    pub(crate) fn failure_exceeds(&self, threshold: f32) -> bool {
        self.is_measured() && self.failure >= threshold
    }

    pub(crate) fn slow_exceeds(&self, threshold: f32) -> bool {
        self.is_measured() && self.slow >= threshold
    }
}

/// Read-only view of a breaker's current window
///
/// Counts describe the window of the current state only; they restart on
/// every transition. `not_permitted_calls` counts rejections in the current
/// state and never affects gating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub buffered_calls: u64,
    pub failed_calls: u64,
    pub successful_calls: u64,
    pub slow_calls: u64,
    pub slow_successful_calls: u64,
    pub slow_failed_calls: u64,
    pub not_permitted_calls: u64,
    pub average_duration: Duration,
}

impl Metrics {
    pub(crate) fn new(snapshot: &Snapshot, minimum_calls: u64, not_permitted_calls: u64) -> Self {
        let rates = Rates::of(snapshot, minimum_calls);
        Self {
            failure_rate: rates.failure,
            slow_call_rate: rates.slow,
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            successful_calls: snapshot.successful_calls(),
            slow_calls: snapshot.slow_calls,
            slow_successful_calls: snapshot.slow_successful_calls(),
            slow_failed_calls: snapshot.slow_failed_calls,
            not_permitted_calls,
            average_duration: snapshot.average_duration(),
        }
    }
}
