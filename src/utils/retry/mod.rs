//! Retry utilities: backoff builders and the engine's status polling schedule.
//!
//! Uses `backon` for exponential backoff. Provides the standard backoff
//! configurations for provisioner calls, dependency readiness waits, and
//! subscription reconnects.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Backoff for transient provisioner RPC failures.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn rpc_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for waiting on a dependency (database port, runner endpoint) to come up.
///
/// Attempts are bounded by the caller's overall deadline rather than a count.
pub fn readiness_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .without_max_times()
        .with_jitter()
}

/// Backoff for re-establishing a dropped stream (schema pull, leader sync).
///
/// - Min delay: 1s
/// - Max delay: 2min
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(120))
        .without_max_times()
        .with_jitter()
}

/// Exponential poll schedule with full jitter.
///
/// The nominal delay starts at `min` and doubles up to `max`. Each yielded
/// delay is drawn uniformly from `[0, nominal]`. The schedule never ends.
pub struct PollSchedule {
    nominal: ExponentialBackoff,
    max: Duration,
}

impl PollSchedule {
    pub fn new(min: Duration, max: Duration) -> Self {
        let nominal = ExponentialBuilder::default()
            .with_min_delay(min)
            .with_max_delay(max)
            .with_factor(2.0)
            .without_max_times()
            .build();
        Self { nominal, max }
    }

    /// Next nominal delay, before jitter is applied.
    pub fn next_nominal(&mut self) -> Duration {
        self.nominal.next().unwrap_or(self.max)
    }
}

impl Iterator for PollSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let nominal = self.next_nominal();
        Some(nominal.mul_f64(rand::random::<f64>()))
    }
}

/// Delay before re-attempting a failed task.
///
/// Doubles per attempt from `base`, capped at `max`.
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}
