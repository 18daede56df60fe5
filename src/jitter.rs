//! Jitter strategies for retry waits.
//!
//! - `None`: deterministic waits; the default, so tick-driven schedules stay reproducible.
//! - `Full`: uniform in `[0, delay]`, spreads a fleet of clients recovering from the same outage.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.
//!
//! RNG: uses `rand`'s thread-local RNG; deterministic RNGs can be injected via `apply_with_rng`.

use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Exact backoff waits.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    /// Randomize `delay` with the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            _ => self.apply_with_rng(delay, &mut rng()),
        }
    }

    /// Randomize `delay` with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            Jitter::Full if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal if millis == 0 => Duration::ZERO,
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
