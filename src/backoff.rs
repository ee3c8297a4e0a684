//! Backoff strategies for retry rules.
//!
//! A [`Backoff`] answers one question for the retrying client: given that `n`
//! attempts were made with this backoff so far, how long to wait before the
//! next one, or `None` if no further attempt may be made.
//!
//! Attempt semantics: [`Backoff::delay`] keeps `attempt = 0` as "no delay";
//! [`Backoff::next_delay`] is called with `attempt >= 1`, the number of
//! attempts already made with this backoff.
//!
//! ```rust
//! use std::time::Duration;
//! use redial::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap()
//!     .with_max_attempts(4);
//! assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(200)));
//! assert_eq!(backoff.next_delay(4), None); // attempt budget spent
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::jitter::Jitter;
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    FixedDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    InvalidJitterRatio(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::FixedDoesNotSupportMax => {
                write!(f, "with_max is only valid for growing backoffs")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::InvalidJitterRatio(ratio) => {
                write!(f, "jitter ratio must be within [0.0, 1.0] (got {})", ratio)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Fixed { delay: Duration },
    Linear { base: Duration, max: Option<Duration> },
    Exponential { base: Duration, max: Option<Duration> },
    Fibonacci { base: Duration, max: Option<Duration> },
}

impl BackoffKind {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let (raw, max) = match *self {
            BackoffKind::Fixed { delay } => (delay, None),
            BackoffKind::Linear { base, max } => {
                (base.checked_mul(attempt).unwrap_or(MAX_BACKOFF), max)
            }
            BackoffKind::Exponential { base, max } => {
                let multiplier = 2u128.saturating_pow(attempt - 1);
                (scale(base, multiplier), max)
            }
            BackoffKind::Fibonacci { base, max } => (scale(base, fibonacci(attempt)), max),
        };
        let capped = max.map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}

fn scale(base: Duration, multiplier: u128) -> Duration {
    let nanos = base.as_nanos().saturating_mul(multiplier);
    Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
}

// 1, 1, 2, 3, 5, ... saturating.
fn fibonacci(n: u32) -> u128 {
    let (mut a, mut b) = (1u128, 1u128);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
        if b == u128::MAX {
            break;
        }
    }
    b
}

/// Delay policy used when a retry rule decides to retry.
///
/// Two backoffs compare equal when their strategy, jitter, and attempt limit
/// are equal. The retrying client keeps a separate attempt counter per
/// backoff, restarting it whenever the decided backoff changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
    jitter: Jitter,
    max_attempts: Option<u32>,
}

impl Backoff {
    fn from_kind(kind: BackoffKind) -> Self {
        Self { kind, jitter: Jitter::None, max_attempts: None }
    }

    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self::from_kind(BackoffKind::Fixed { delay })
    }

    /// Alias of [`Backoff::fixed`].
    pub fn constant(delay: Duration) -> Self {
        Self::fixed(delay)
    }

    /// Retry immediately.
    pub fn without_delay() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// `base * attempt`
    pub fn linear(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Linear { base, max: None })
    }

    /// `base * 2^(attempt - 1)`
    pub fn exponential(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Exponential { base, max: None })
    }

    /// `base * fib(attempt)`
    pub fn fibonacci(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Fibonacci { base, max: None })
    }

    /// Cap a growing backoff.
    /// Returns an error if called on a fixed backoff, if `max` is zero, or if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Linear { base, max: existing }
            | BackoffKind::Exponential { base, max: existing }
            | BackoffKind::Fibonacci { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Fixed { .. } => Err(BackoffError::FixedDoesNotSupportMax),
        }
    }

    /// Randomize each delay.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop once `max_attempts` attempts were made with this backoff.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn jitter(&self) -> &Jitter {
        &self.jitter
    }

    /// Base delay for a given attempt number, without jitter (0 = initial call, no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.kind.delay(attempt)
    }

    /// Delay before the next attempt, given the attempts made so far with this
    /// backoff, or `None` when this backoff allows no further attempt.
    pub fn next_delay(&self, attempts_so_far: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempts_so_far >= max {
                return None;
            }
        }
        Some(self.jitter.apply(self.delay(attempts_so_far)).min(MAX_BACKOFF))
    }
}

impl Default for Backoff {
    /// Exponential from 200ms up to 10s with 20% jitter.
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential {
                base: Duration::from_millis(200),
                max: Some(Duration::from_secs(10)),
            },
            jitter: Jitter::Ratio(0.2),
            max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_returns_same_delay() {
        let backoff = Backoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let backoff = Backoff::fibonacci(Duration::from_millis(10));
        let delays: Vec<u128> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 80, 130]);
        assert_eq!(backoff.delay(10_000), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validates() {
        assert_eq!(
            Backoff::fixed(Duration::from_millis(1)).with_max(Duration::from_secs(1)),
            Err(BackoffError::FixedDoesNotSupportMax)
        );
        assert_eq!(
            Backoff::linear(Duration::from_millis(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }

    #[test]
    fn without_delay_with_max_attempts_exhausts() {
        let backoff = Backoff::without_delay().with_max_attempts(10);
        for attempt in 1..10 {
            assert_eq!(backoff.next_delay(attempt), Some(Duration::ZERO));
        }
        assert_eq!(backoff.next_delay(10), None);
        assert_eq!(backoff.next_delay(11), None);
    }

    #[test]
    fn default_backoff_stays_within_jitter_bounds() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let first = backoff.next_delay(1).unwrap();
            assert!(first >= Duration::from_millis(160) && first <= Duration::from_millis(240));
        }
        let capped = backoff.next_delay(30).unwrap();
        assert!(capped <= Duration::from_secs(12));
    }

    #[test]
    fn equality_is_by_value() {
        let a = Backoff::fixed(Duration::from_millis(5)).with_max_attempts(3);
        let b = Backoff::fixed(Duration::from_millis(5)).with_max_attempts(3);
        assert_eq!(a, b);
        assert_ne!(a, b.with_max_attempts(4));
    }
}
