//! Exponential backoff for the retry scheduler.
//!
//! Attempt semantics: attempt index `0` is the initial call (no delay); the wait before retry `n`
//! is `delay(n) = base * 2^(n-1)`. The scheduler precomputes these into a [`DelayTable`] once at
//! construction so the per-tick path never does arithmetic on durations.
//!
//! ```rust
//! use std::time::Duration;
//! use courier::backoff::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(1000));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(2), Duration::from_secs(2));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use std::time::Duration;

/// Ceiling applied when doubling would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Rejected backoff cap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max retry delay must be greater than zero")]
    MaxMustBePositive,
    #[error("max retry delay ({max:?}) must be >= base delay ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Doubling backoff with an optional ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Create an exponential backoff starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap every delay at `max`. Errors if `max` is zero or smaller than the base.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the given attempt (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| delay.min(m)).unwrap_or(delay);
        capped.min(MAX_BACKOFF)
    }

    /// Precompute the waits for a task allowed `max_attempts` invocations.
    pub fn table(&self, max_attempts: usize) -> DelayTable {
        DelayTable { delays: (0..max_attempts).map(|attempt| self.delay(attempt)).collect() }
    }
}

/// Precomputed backoff waits indexed by the number of attempts already used.
///
/// `get(0)` is always zero; `get(n)` for `n >= 1` is the wait after the `n`th failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayTable {
    delays: Vec<Duration>,
}

impl DelayTable {
    /// Wait after `attempts_used` failed attempts. Indices past the table reuse the last entry.
    pub fn get(&self, attempts_used: usize) -> Duration {
        self.delays
            .get(attempts_used)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Sum of waits a task sleeps before succeeding on attempt `k` (1-based).
    pub fn total_before(&self, k: usize) -> Duration {
        (1..k).map(|i| self.get(i)).sum()
    }
}
