//! Exponentially weighted moving averages.
//!
//! Two variants:
//! - [`Ewma`] decays on a half-life schedule against a monotonic clock;
//!   used for failure accrual.
//! - [`SampleEwma`] decays per inserted sample rather than per elapsed
//!   second; used for the reenqueue rate.
//!
//! Time comes from `tokio::time::Instant`, so paused-clock tests can drive
//! decay deterministically.

use std::f64::consts::LN_2;
use std::time::Duration;

use tokio::time::Instant;

/// Half-life EWMA over a monotonic clock.
///
/// Update rule on `insert(x)` at time `t`:
/// `alpha = exp(-(t - t_last) * ln2 / half_life); value = alpha * value + (1 - alpha) * x`.
///
/// Reads decay lazily: `value()` at time `t` reports `alpha * value` for the
/// elapsed time with no interpolation toward a new sample.
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    last_update: Instant,
    half_life: Duration,
}

impl Ewma {
    /// Create an EWMA with the given half-life and initial value.
    pub fn new(half_life: Duration, initial: f64) -> Self {
        Self {
            value: initial,
            last_update: Instant::now(),
            half_life,
        }
    }

    /// Insert a sample at the current time.
    pub fn insert(&mut self, x: f64) {
        let now = Instant::now();
        let alpha = self.alpha(now);
        self.value = alpha * self.value + (1.0 - alpha) * x;
        self.last_update = now;
    }

    /// Current value with lazy decay applied for the elapsed time.
    pub fn value(&self) -> f64 {
        self.value * self.alpha(Instant::now())
    }

    /// Overwrite the value, restarting the decay clock.
    pub fn reset(&mut self, value: f64) {
        self.value = value;
        self.last_update = Instant::now();
    }

    /// Instant of the last insert or reset.
    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// The configured half-life.
    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    fn alpha(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update);
        (-elapsed.as_secs_f64() * LN_2 / self.half_life.as_secs_f64()).exp()
    }
}

/// EWMA with a half-life measured in samples instead of seconds.
///
/// Each insert applies `value = alpha * value + (1 - alpha) * x` with a
/// constant `alpha = 2^(-1 / half_life_samples)`.
#[derive(Debug, Clone)]
pub struct SampleEwma {
    value: f64,
    alpha: f64,
}

impl SampleEwma {
    /// Create an EWMA whose value halves after `half_life_samples` inserts
    /// of zero.
    pub fn new(half_life_samples: f64, initial: f64) -> Self {
        Self {
            value: initial,
            alpha: (-LN_2 / half_life_samples).exp(),
        }
    }

    /// Insert a sample.
    pub fn insert(&mut self, x: f64) {
        self.value = self.alpha * self.value + (1.0 - self.alpha) * x;
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }
}
