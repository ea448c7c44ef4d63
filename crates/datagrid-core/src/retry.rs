//! Backoff and timeout math shared by cluster connection retries.
//!
//! A [`RetryStrategy`] starts at `initial_backoff_ms` and grows the backoff by
//! `multiplier` after every wait, capped at `max_backoff_ms`. The total time
//! budget is `timeout_ms` measured from creation (or the last restart);
//! a negative timeout means "retry forever".

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::options::RetryOptions;

/// Exponential backoff with an overall time budget and optional jitter.
pub struct RetryStrategy {
    name: String,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    multiplier: f64,
    timeout_ms: i64,
    jitter: f64,
    backoff_ms: u64,
    attempts: u32,
    start: Instant,
    clock: SharedClock,
}

impl RetryStrategy {
    pub fn new(
        name: impl Into<String>,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        multiplier: f64,
        timeout_ms: i64,
        jitter: f64,
        clock: SharedClock,
    ) -> Self {
        let start = clock.now();
        Self {
            name: name.into(),
            initial_backoff_ms,
            max_backoff_ms,
            multiplier,
            timeout_ms,
            jitter: jitter.clamp(0.0, 1.0),
            backoff_ms: initial_backoff_ms,
            attempts: 0,
            start,
            clock,
        }
    }

    pub fn from_options(name: impl Into<String>, options: &RetryOptions, clock: SharedClock) -> Self {
        Self::new(
            name,
            options.initial_backoff_ms,
            options.max_backoff_ms,
            options.multiplier,
            options.cluster_connect_timeout_ms,
            options.jitter,
            clock,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backoff that the next wait will use, before jitter.
    pub fn current_backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    /// Number of completed waits since creation or the last restart.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Grow the backoff by the multiplier, capped at the maximum.
    pub fn get_new_backoff(&mut self) -> u64 {
        let grown = (self.backoff_ms as f64 * self.multiplier).round();
        self.backoff_ms = if grown >= self.max_backoff_ms as f64 {
            self.max_backoff_ms
        } else {
            grown as u64
        };
        self.backoff_ms
    }

    /// Whether the time budget is spent after `elapsed_ms` of retrying.
    pub fn is_exhausted(&self, elapsed_ms: u64) -> bool {
        self.remaining_ms(elapsed_ms).is_none()
    }

    fn remaining_ms(&self, elapsed_ms: u64) -> Option<u64> {
        if self.timeout_ms < 0 {
            return Some(u64::MAX);
        }
        let remaining = self.timeout_ms - elapsed_ms.min(i64::MAX as u64) as i64;
        (remaining > 0).then_some(remaining as u64)
    }

    /// Delay to apply after `elapsed_ms` of retrying, or 0 once the time
    /// budget is spent. While budget remains the delay is at least 1 ms.
    pub fn get_delay(&self, elapsed_ms: u64) -> u64 {
        let Some(remaining) = self.remaining_ms(elapsed_ms) else {
            return 0;
        };

        let backoff = if self.jitter > 0.0 {
            let factor = 1.0 + self.jitter * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
            (self.backoff_ms as f64 * factor).round() as u64
        } else {
            self.backoff_ms
        };

        backoff.max(1).min(remaining)
    }

    /// Wait for the next attempt. Returns `false` without waiting when the
    /// time budget is exhausted.
    pub async fn wait(&mut self) -> bool {
        let elapsed = self.clock.elapsed_ms(self.start);
        if self.is_exhausted(elapsed) {
            warn!(
                "{}: unable to succeed after {} attempts and {} ms, giving up",
                self.name, self.attempts, elapsed
            );
            return false;
        }

        let delay = self.get_delay(elapsed);
        debug!(
            "{}: attempt {} failed, retrying in {} ms",
            self.name,
            self.attempts + 1,
            delay
        );
        self.clock.sleep(Duration::from_millis(delay)).await;
        self.get_new_backoff();
        self.attempts += 1;
        true
    }

    /// Reset the backoff and restart the time budget.
    pub fn restart(&mut self) {
        self.backoff_ms = self.initial_backoff_ms;
        self.attempts = 0;
        self.start = self.clock.now();
    }
}
