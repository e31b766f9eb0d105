//! Bounded trial-permit pool for the half-open state
//!
//! A half-open breaker lets a fixed number of trial calls through. Permits are
//! taken with an atomic decrement-if-positive, so racing callers can never
//! both win the last permit.

use std::sync::atomic::{AtomicU32, Ordering};

/// Atomic pool of trial permits
#[derive(Debug)]
pub struct TrialPermits {
    /// Total permits granted when the pool was created
    limit: u32,
    /// Permits still available
    available: AtomicU32,
}

impl TrialPermits {
    /// Create a full pool of `limit` permits
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            available: AtomicU32::new(limit),
        }
    }

    /// Take one permit without blocking
    ///
    /// Returns `false` once the pool is exhausted; it never goes below zero.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return false;
            }

            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a permit taken by a call that ended up not counting
    ///
    /// Never grows the pool beyond its limit.
    pub fn release(&self) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            });
    }

    /// Permits still available
    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    /// Permits the pool started with
    pub fn limit(&self) -> u32 {
        self.limit
    }
}
