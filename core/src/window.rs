//! Sliding windows aggregating call outcomes
//!
//! This module provides the window implementations behind every breaker state:
//! - `CountWindow`: ring of the last N calls, one call per slot
//! - `TimeWindow`: ring of N one-second buckets
//! - `NullWindow`: discards everything, used while the breaker is disabled
//!
//! Windows keep running totals next to the ring so both `record` and
//! `snapshot` are O(1); every slot change is mirrored into the totals as a
//! single delta. Writers never lock. Each total is an independent atomic lane,
//! and readers use a generation/pending protocol to return a snapshot no
//! writer was halfway through. Under sustained contention a reader gives up
//! after a bounded number of retries and returns a clamped snapshot that still
//! satisfies the [`Snapshot`] invariants.

use crate::clock::{Clock, duration_nanos};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Length of one time-based bucket
pub const BUCKET_NANOS: u64 = 1_000_000_000;

/// Snapshot reads retried before settling for a clamped view
const SNAPSHOT_ATTEMPTS: usize = 32;

/// One completed call, as seen by a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub failed: bool,
    pub slow: bool,
    pub duration: Duration,
}

impl Outcome {
    pub fn success(duration: Duration, slow: bool) -> Self {
        Self {
            failed: false,
            slow,
            duration,
        }
    }

    pub fn failure(duration: Duration, slow: bool) -> Self {
        Self {
            failed: true,
            slow,
            duration,
        }
    }
}

/// Point-in-time aggregate of a window
///
/// Always satisfies `slow_failed_calls <= min(failed_calls, slow_calls)` and
/// `failed_calls + successful_calls() == total_calls`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub slow_failed_calls: u64,
    pub total_duration: Duration,
}

impl Snapshot {
    pub fn successful_calls(&self) -> u64 {
        self.total_calls - self.failed_calls
    }

    pub fn slow_successful_calls(&self) -> u64 {
        self.slow_calls - self.slow_failed_calls
    }

    /// Mean duration of the buffered calls, zero when the window is empty
    pub fn average_duration(&self) -> Duration {
        match u32::try_from(self.total_calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_duration / calls,
            Err(_) => Duration::from_nanos(duration_nanos(self.total_duration) / self.total_calls),
        }
    }

    fn from_tally(tally: Tally) -> Self {
        let [calls, failed, slow, slow_failed, nanos] = tally.0.map(|lane| lane.max(0) as u64);
        let failed = failed.min(calls);
        let slow = slow.min(calls);
        Self {
            total_calls: calls,
            failed_calls: failed,
            slow_calls: slow,
            slow_failed_calls: slow_failed.min(failed).min(slow),
            total_duration: Duration::from_nanos(nanos),
        }
    }
}

/// Fixed-capacity aggregator of call outcomes
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Add one outcome and return the totals right after it
    fn record(&self, outcome: Outcome) -> Snapshot;

    /// Current totals
    fn snapshot(&self) -> Snapshot;
}

const CALL: u8 = 0b001;
const FAILED: u8 = 0b010;
const SLOW: u8 = 0b100;

// Lanes: calls, failed, slow, slow_failed, duration nanos
const LANES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally([i64; LANES]);

impl Tally {
    fn from_code(code: u8, nanos: u64) -> Self {
        if code & CALL == 0 {
            return Tally::default();
        }
        let failed = code & FAILED != 0;
        let slow = code & SLOW != 0;
        Tally([
            1,
            i64::from(failed),
            i64::from(slow),
            i64::from(failed && slow),
            i64::try_from(nanos).unwrap_or(i64::MAX),
        ])
    }

    fn of(outcome: &Outcome) -> Self {
        Tally::from_code(encode(outcome), duration_nanos(outcome.duration))
    }

    fn minus(self, other: Tally) -> Self {
        let mut lanes = self.0;
        for (lane, sub) in lanes.iter_mut().zip(other.0) {
            *lane = lane.wrapping_sub(sub);
        }
        Tally(lanes)
    }

    fn negated(self) -> Self {
        Tally::default().minus(self)
    }
}

fn encode(outcome: &Outcome) -> u8 {
    let mut code = CALL;
    if outcome.failed {
        code |= FAILED;
    }
    if outcome.slow {
        code |= SLOW;
    }
    code
}

#[derive(Debug, Default)]
struct Lanes([AtomicI64; LANES]);

impl Lanes {
    fn add(&self, tally: &Tally) {
        for (lane, delta) in self.0.iter().zip(tally.0) {
            if delta != 0 {
                lane.fetch_add(delta, Ordering::SeqCst);
            }
        }
    }

    fn take(&self) -> Tally {
        Tally(std::array::from_fn(|i| self.0[i].swap(0, Ordering::SeqCst)))
    }

    fn load(&self) -> Tally {
        Tally(std::array::from_fn(|i| self.0[i].load(Ordering::SeqCst)))
    }
}

/// Running totals with a consistent-read protocol
///
/// Writers bump `pending` around each delta and `generation` once it is fully
/// applied. A read is accepted only when no writer was pending on either side
/// of it and the generation did not move.
#[derive(Debug, Default)]
struct Totals {
    lanes: Lanes,
    pending: AtomicU64,
    generation: AtomicU64,
}

impl Totals {
    fn apply(&self, delta: &Tally) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.lanes.add(delta);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn read(&self) -> Snapshot {
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let generation = self.generation.load(Ordering::SeqCst);
            if self.pending.load(Ordering::SeqCst) == 0 {
                let tally = self.lanes.load();
                if self.pending.load(Ordering::SeqCst) == 0
                    && self.generation.load(Ordering::SeqCst) == generation
                {
                    return Snapshot::from_tally(tally);
                }
            }
            std::hint::spin_loop();
        }
        Snapshot::from_tally(self.lanes.load())
    }
}

#[derive(Debug, Default)]
struct Slot {
    code: AtomicU8,
    nanos: AtomicU64,
}

/// Window over the last `size` calls
///
/// Each writer claims its own slot through an atomic cursor, so concurrent
/// writers only meet when the ring laps itself within one call's lifetime.
#[derive(Debug)]
pub struct CountWindow {
    slots: Box<[Slot]>,
    cursor: AtomicU64,
    totals: Totals,
}

impl CountWindow {
    /// # Panics
    ///
    /// Panics if `size` is 0.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "Window size must be greater than 0");
        Self {
            slots: (0..size).map(|_| Slot::default()).collect(),
            cursor: AtomicU64::new(0),
            totals: Totals::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }
}

impl SlidingWindow for CountWindow {
    fn record(&self, outcome: Outcome) -> Snapshot {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len() as u64;
        let slot = &self.slots[index as usize];

        let nanos = duration_nanos(outcome.duration);
        let evicted_code = slot.code.swap(encode(&outcome), Ordering::SeqCst);
        let evicted_nanos = slot.nanos.swap(nanos, Ordering::SeqCst);

        let evicted = Tally::from_code(evicted_code, evicted_nanos);
        self.totals.apply(&Tally::of(&outcome).minus(evicted));
        self.totals.read()
    }

    fn snapshot(&self) -> Snapshot {
        self.totals.read()
    }
}

#[derive(Debug)]
struct Bucket {
    epoch: AtomicU64,
    lanes: Lanes,
}

/// Window over the last `size` seconds
///
/// Bucket `i` holds the time unit `epoch` with `epoch % size == i`. The head
/// is the newest epoch seen; the thread that moves it forward expires every
/// bucket it skipped over (at most one full lap) before writers for the new
/// epoch may touch them.
#[derive(Debug)]
pub struct TimeWindow {
    buckets: Box<[Bucket]>,
    head: AtomicU64,
    clock: Arc<dyn Clock>,
    totals: Totals,
}

impl TimeWindow {
    /// # Panics
    ///
    /// Panics if `size` is 0.
    pub fn new(size: usize, clock: Arc<dyn Clock>) -> Self {
        assert!(size > 0, "Window size must be greater than 0");
        let len = size as u64;
        // Epochs are offset by the window length so the initial lap never underflows
        let head = clock.now_nanos() / BUCKET_NANOS + len;
        let buckets = (0..len)
            .map(|i| Bucket {
                epoch: AtomicU64::new(head - (head + len - i) % len),
                lanes: Lanes::default(),
            })
            .collect();

        Self {
            buckets,
            head: AtomicU64::new(head),
            clock,
            totals: Totals::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    fn len(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn current_epoch(&self) -> u64 {
        self.clock.now_nanos() / BUCKET_NANOS + self.len()
    }

    fn bucket(&self, epoch: u64) -> &Bucket {
        &self.buckets[(epoch % self.len()) as usize]
    }

    /// Move the head to `now` if it is newer and return the resulting head
    fn advance(&self, now: u64) -> u64 {
        let mut head = self.head.load(Ordering::Acquire);
        while now > head {
            match self
                .head
                .compare_exchange_weak(head, now, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.expire(head, now);
                    return now;
                }
                Err(actual) => head = actual,
            }
        }
        head
    }

    /// Zero the buckets for epochs in `(from, to]`, capped at one lap
    fn expire(&self, from: u64, to: u64) {
        let start = (from + 1).max(to.saturating_sub(self.len() - 1));
        for epoch in start..=to {
            let bucket = self.bucket(epoch);
            if bucket.epoch.load(Ordering::Acquire) >= epoch {
                continue;
            }
            let stale = bucket.lanes.take();
            self.totals.apply(&stale.negated());
            bucket.epoch.fetch_max(epoch, Ordering::AcqRel);
        }
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&self, outcome: Outcome) -> Snapshot {
        let tally = Tally::of(&outcome);
        let mut spins = 0u32;
        loop {
            let head = self.advance(self.current_epoch());
            let bucket = self.bucket(head);
            let epoch = bucket.epoch.load(Ordering::Acquire);

            if epoch == head {
                bucket.lanes.add(&tally);
                self.totals.apply(&tally);
                return self.totals.read();
            }

            // epoch < head: the thread that moved the head is still clearing this bucket
            // epoch > head: the head moved again, retry against the new one
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.advance(self.current_epoch());
        self.totals.read()
    }
}

/// Window that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWindow;

impl SlidingWindow for NullWindow {
    fn record(&self, _outcome: Outcome) -> Snapshot {
        Snapshot::default()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::default()
    }
}
