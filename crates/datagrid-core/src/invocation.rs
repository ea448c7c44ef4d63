//! One outstanding request and its retry bookkeeping.
//!
//! An invocation keeps its start instant for its whole life while its
//! correlation id changes on every physical resend. Retries first go out
//! immediately (the "fast" budget), then with a doubling delay floored by
//! the minimum retry delay and capped by what is left of the retry timeout.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::ClientMessage;

use crate::clock::SharedClock;
use crate::options::MessagingOptions;

/// Where an invocation should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationTarget {
    /// Any connected member, chosen by the load balancer.
    Any,
    /// A specific member.
    Member(Uuid),
    /// The owner of a partition.
    Partition(i32),
}

/// A logical request awaiting a correlated response.
pub struct Invocation {
    message: ClientMessage,
    target: InvocationTarget,
    start: Instant,
    attempts: u32,
    retry_safe: bool,
    options: MessagingOptions,
    clock: SharedClock,
}

impl Invocation {
    pub fn new(
        mut message: ClientMessage,
        target: InvocationTarget,
        correlation_id: i64,
        options: &MessagingOptions,
        clock: SharedClock,
    ) -> Self {
        message.correlation_id = correlation_id;
        if let InvocationTarget::Partition(partition_id) = target {
            message.partition_id = partition_id;
        }
        let start = clock.now();
        Self {
            message,
            target,
            start,
            attempts: 0,
            retry_safe: false,
            options: options.clone(),
            clock,
        }
    }

    /// Mark the request as safe to resend after its target disconnected
    /// (read-only or idempotent operations).
    pub fn retry_safe(mut self) -> Self {
        self.retry_safe = true;
        self
    }

    pub fn correlation_id(&self) -> i64 {
        self.message.correlation_id
    }

    pub fn message(&self) -> &ClientMessage {
        &self.message
    }

    pub fn target(&self) -> InvocationTarget {
        self.target
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed_ms(self.start)
    }

    /// Whether `error` may be cured by sending the request again.
    pub fn should_retry(&self, error: &ClientError) -> bool {
        match error {
            ClientError::TargetDisconnected { .. } => {
                self.retry_safe || self.options.redo_operations
            }
            ClientError::ClientNotActive => false,
            e => e.is_retryable(),
        }
    }

    /// Wait before the next resend and assign a fresh correlation id.
    ///
    /// Fails with [`ClientError::OperationTimeout`] once the retry timeout
    /// has elapsed.
    pub async fn wait_retry(&mut self, next_correlation_id: impl FnOnce() -> i64) -> ClientResult<()> {
        let budget_ms = self.options.retry_timeout_secs.saturating_mul(1000);
        let elapsed_ms = self.elapsed_ms();
        if elapsed_ms >= budget_ms {
            return Err(ClientError::OperationTimeout { elapsed_ms });
        }

        self.attempts += 1;
        if self.attempts > self.options.max_fast_invocation_count {
            let exponent = (self.attempts - self.options.max_fast_invocation_count - 1).min(32);
            let delay_ms = (1u64 << exponent)
                .max(self.options.min_retry_delay_ms)
                .min(budget_ms - elapsed_ms);
            debug!(
                "invocation {}: retry {} in {} ms",
                self.message.correlation_id, self.attempts, delay_ms
            );
            self.clock.sleep(Duration::from_millis(delay_ms)).await;
        }

        self.message.correlation_id = next_correlation_id();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tokio_clock;
    use datagrid_proto::error::ErrorCode;

    fn options(fast: u32, min_delay_ms: u64, timeout_secs: u64) -> MessagingOptions {
        MessagingOptions {
            retry_timeout_secs: timeout_secs,
            max_fast_invocation_count: fast,
            min_retry_delay_ms: min_delay_ms,
            ..MessagingOptions::default()
        }
    }

    fn invocation(options: &MessagingOptions) -> Invocation {
        Invocation::new(
            ClientMessage::request("op", vec![]),
            InvocationTarget::Any,
            1,
            options,
            tokio_clock(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_retries_do_not_wait() {
        let opts = options(3, 1000, 120);
        let mut inv = invocation(&opts);
        let start = Instant::now();
        let mut next = 1;
        for _ in 0..3 {
            inv.wait_retry(|| {
                next += 1;
                next
            })
            .await
            .unwrap();
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(inv.correlation_id(), 4);
        assert_eq!(inv.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_retries_double() {
        let opts = options(0, 1, 120);
        let mut inv = invocation(&opts);
        let mut expected = Vec::new();
        let mut observed = Vec::new();
        for i in 0..5 {
            let before = Instant::now();
            inv.wait_retry(|| 10 + i).await.unwrap();
            observed.push((Instant::now() - before).as_millis() as u64);
            expected.push(1u64 << i);
        }
        assert_eq!(observed, expected);
        assert_eq!(inv.correlation_id(), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_delay_floor() {
        let opts = options(0, 250, 120);
        let mut inv = invocation(&opts);
        let before = Instant::now();
        inv.wait_retry(|| 2).await.unwrap();
        assert_eq!((Instant::now() - before).as_millis(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_capped_by_remaining_budget_then_timeout() {
        let opts = options(0, 1500, 2);
        let mut inv = invocation(&opts);
        inv.wait_retry(|| 2).await.unwrap(); // 1500 ms
        let before = Instant::now();
        inv.wait_retry(|| 3).await.unwrap(); // capped to the remaining 500 ms
        assert_eq!((Instant::now() - before).as_millis(), 500);

        let err = inv.wait_retry(|| 4).await.unwrap_err();
        assert_eq!(err, ClientError::OperationTimeout { elapsed_ms: 2000 });
        // start time never moves
        assert_eq!(inv.elapsed_ms(), 2000);
    }

    #[tokio::test]
    async fn test_retry_decisions() {
        let opts = MessagingOptions::default();
        let inv = invocation(&opts);
        let disconnected = ClientError::TargetDisconnected {
            address: "127.0.0.1:5701".into(),
        };
        assert!(!inv.should_retry(&disconnected));
        assert!(inv.should_retry(&ClientError::NotConnected));
        assert!(inv.should_retry(&ClientError::server(ErrorCode::WrongTarget, "moved")));
        assert!(!inv.should_retry(&ClientError::server(ErrorCode::IllegalArgument, "no")));
        assert!(!inv.should_retry(&ClientError::ClientNotActive));

        let safe = invocation(&opts).retry_safe();
        assert!(safe.should_retry(&disconnected));

        let redo = MessagingOptions {
            redo_operations: true,
            ..MessagingOptions::default()
        };
        assert!(invocation(&redo).should_retry(&disconnected));
    }

    #[tokio::test]
    async fn test_partition_target_sets_partition_id() {
        let inv = Invocation::new(
            ClientMessage::request("op", vec![]),
            InvocationTarget::Partition(42),
            9,
            &MessagingOptions::default(),
            tokio_clock(),
        );
        assert_eq!(inv.message().partition_id, 42);
        assert_eq!(inv.correlation_id(), 9);
    }
}
