use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Upper bound on any computed delay. Keeps `now + delay` representable.
const CEILING_SECS: f64 = 10.0 * 365.0 * 24.0 * 60.0 * 60.0;

/// Retry delay in seconds for the given attempt: `base ^ attempt`.
pub fn delay(attempt: u32, base: f64) -> f64 {
    base.powi(i32::try_from(attempt).unwrap_or(i32::MAX))
}

/// Exponential backoff with an optional cap and jitter.
///
/// With no cap and zero jitter this is exactly [`delay`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: f64,
    pub max_delay: Option<f64>,
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Option<f64>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.backoff_base)
            .with_max_delay(config.backoff_max)
            .with_jitter(config.backoff_jitter)
    }

    /// Delay before the job may run again after its `attempt`-th failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut secs = delay(attempt, self.base);

        if let Some(max) = self.max_delay {
            secs = secs.min(max);
        }

        if self.jitter > 0.0 && secs.is_finite() {
            let spread = secs * self.jitter;
            secs += rand::rng().random_range(0.0..=spread);
        }

        if !secs.is_finite() || secs > CEILING_SECS {
            secs = CEILING_SECS;
        }

        Duration::from_secs_f64(secs.max(0.0))
    }
}
