//! Injectable time source.
//!
//! Retry and heartbeat math reads time through [`Clock`] so that tests can
//! drive it with tokio's paused clock (`#[tokio::test(start_paused = true)]`)
//! or substitute their own implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Source of the current instant and of delays.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Suspend the caller for `duration`. Never spins.
    async fn sleep(&self, duration: Duration);

    /// Milliseconds elapsed since `since`.
    fn elapsed_ms(&self, since: Instant) -> u64 {
        self.now().saturating_duration_since(since).as_millis() as u64
    }
}

/// Clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default clock.
pub fn tokio_clock() -> SharedClock {
    Arc::new(TokioClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = tokio_clock();
        let start = clock.now();
        clock.sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.elapsed_ms(start), 1500);
    }
}
