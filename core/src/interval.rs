//! Wait intervals between an OPEN episode and the next half-open probe
//!
//! The interval is a function of the backoff attempt counter, the number of
//! consecutive OPEN episodes since the breaker was last CLOSED. Attempts are
//! 1-based: the first time a breaker trips it waits `interval.wait(1)`.
//!
//! Exponential growth and jitter are delegated to `chrono-machines`, which
//! computes `delay = min(base * multiplier^(attempt-1), max)` and applies
//! jitter as `delay * (1 - jitter + rand * jitter)`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Custom wait function
pub type WaitFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Policy mapping an attempt number to the time spent OPEN before probing
///
/// Exponential and randomized policies compute in whole milliseconds;
/// validation rejects durations with a sub-millisecond part for them.
/// `Fixed` and `Custom` waits are used exactly as given.
#[derive(Clone)]
pub enum WaitInterval {
    /// Same wait for every attempt
    Fixed(Duration),
    /// `initial * multiplier^(attempt-1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
    /// `base` reduced by up to `jitter` (0.0-1.0) of itself at random
    Randomized { base: Duration, jitter: f64 },
    /// Exponential growth with jitter applied to each computed delay
    ExponentialRandomized {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    },
    /// Caller supplied function of the attempt number
    Custom(WaitFn),
}

impl WaitInterval {
    pub fn fixed(wait: Duration) -> Self {
        WaitInterval::Fixed(wait)
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        WaitInterval::Exponential {
            initial,
            multiplier,
            max,
        }
    }

    pub fn randomized(base: Duration, jitter: f64) -> Self {
        WaitInterval::Randomized { base, jitter }
    }

    pub fn exponential_randomized(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    ) -> Self {
        WaitInterval::ExponentialRandomized {
            initial,
            multiplier,
            max,
            jitter,
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        WaitInterval::Custom(Arc::new(f))
    }

    /// Wait duration for the given 1-based attempt
    pub fn wait(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            WaitInterval::Fixed(wait) => *wait,
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
            } => backoff(*initial, *multiplier, *max, attempt, 0.0),
            WaitInterval::Randomized { base, jitter } => backoff(*base, 1.0, *base, 1, *jitter),
            WaitInterval::ExponentialRandomized {
                initial,
                multiplier,
                max,
                jitter,
            } => backoff(*initial, *multiplier, *max, attempt, *jitter),
            WaitInterval::Custom(f) => f(attempt),
        }
    }

    /// Check the policy's parameters, naming the offending one
    pub(crate) fn check(&self) -> Result<(), &'static str> {
        let (multiplier, jitter, initial, max) = match self {
            WaitInterval::Fixed(_) | WaitInterval::Custom(_) => return Ok(()),
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
            } => (*multiplier, 0.0, *initial, *max),
            WaitInterval::Randomized { base, jitter } => (1.0, *jitter, *base, *base),
            WaitInterval::ExponentialRandomized {
                initial,
                multiplier,
                max,
                jitter,
            } => (*multiplier, *jitter, *initial, *max),
        };

        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err("multiplier must be a finite value >= 1.0");
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err("jitter must be between 0.0 and 1.0");
        }
        if max < initial {
            return Err("max wait must not be shorter than the initial wait");
        }
        if has_sub_millis(initial) || has_sub_millis(max) {
            return Err("exponential and randomized waits must be whole milliseconds");
        }
        Ok(())
    }
}

fn backoff(
    initial: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
    jitter: f64,
) -> Duration {
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: millis(initial),
        multiplier,
        max_delay_ms: millis(max),
    };
    // The policy counts attempts in a u8; past that every exponential policy is capped anyway
    let attempt = u8::try_from(attempt).unwrap_or(u8::MAX);
    Duration::from_millis(policy.calculate_delay(attempt, jitter))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn has_sub_millis(d: Duration) -> bool {
    d.subsec_nanos() % 1_000_000 != 0
}

impl Default for WaitInterval {
    fn default() -> Self {
        WaitInterval::Fixed(Duration::from_secs(60))
    }
}

impl fmt::Debug for WaitInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitInterval::Fixed(wait) => f.debug_tuple("Fixed").field(wait).finish(),
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            WaitInterval::Randomized { base, jitter } => f
                .debug_struct("Randomized")
                .field("base", base)
                .field("jitter", jitter)
                .finish(),
            WaitInterval::ExponentialRandomized {
                initial,
                multiplier,
                max,
                jitter,
            } => f
                .debug_struct("ExponentialRandomized")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            WaitInterval::Custom(_) => f.debug_tuple("Custom").field(&"<closure>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fixed_interval_ignores_attempt() {
        let interval = WaitInterval::fixed(Duration::from_millis(250));

        assert_eq!(interval.wait(1), Duration::from_millis(250));
        assert_eq!(interval.wait(7), Duration::from_millis(250));
        assert_eq!(interval.wait(0), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_interval_grows_and_caps() {
        let interval = WaitInterval::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1000),
        );

        let first = interval.wait(1);
        let second = interval.wait(2);
        let third = interval.wait(3);

        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(400));
        assert_eq!(interval.wait(40), Duration::from_millis(1000));
        assert_eq!(interval.wait(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_randomized_interval_within_bounds() {
        let interval = WaitInterval::randomized(Duration::from_millis(1000), 0.5);
        let mut seen = HashSet::new();

        for _ in 0..50 {
            let wait = interval.wait(1);
            assert!(wait >= Duration::from_millis(490), "{wait:?} below bound");
            assert!(wait <= Duration::from_millis(1000), "{wait:?} above bound");
            seen.insert(wait);
        }

        assert!(seen.len() >= 2, "Jitter should produce variance");
    }

    #[test]
    fn test_custom_interval() {
        let interval = WaitInterval::custom(|attempt| Duration::from_secs(u64::from(attempt) * 10));

        assert_eq!(interval.wait(1), Duration::from_secs(10));
        assert_eq!(interval.wait(3), Duration::from_secs(30));
    }

    #[test]
    fn test_check_rejects_bad_parameters() {
        let shrinking =
            WaitInterval::exponential(Duration::from_secs(1), 0.5, Duration::from_secs(10));
        assert!(shrinking.check().is_err());

        let wild_jitter = WaitInterval::randomized(Duration::from_secs(1), 1.5);
        assert!(wild_jitter.check().is_err());

        let inverted =
            WaitInterval::exponential(Duration::from_secs(10), 2.0, Duration::from_secs(1));
        assert!(inverted.check().is_err());

        assert!(WaitInterval::default().check().is_ok());
    }

    #[test]
    fn test_check_requires_whole_millis_for_backoff() {
        let exponential = WaitInterval::exponential(
            Duration::from_micros(1500),
            2.0,
            Duration::from_secs(1),
        );
        assert!(exponential.check().is_err());

        let capped = WaitInterval::exponential_randomized(
            Duration::from_millis(100),
            2.0,
            Duration::from_nanos(1_000_000_500),
            0.2,
        );
        assert!(capped.check().is_err());

        let randomized = WaitInterval::randomized(Duration::from_micros(999), 0.5);
        assert!(randomized.check().is_err());

        // Fixed waits keep their precision
        let precise = WaitInterval::fixed(Duration::from_micros(1500));
        assert!(precise.check().is_ok());
        assert_eq!(precise.wait(1), Duration::from_micros(1500));
    }
}
