//! Tunable operational defaults for the datagrid client.
//!
//! This module centralizes the configurable defaults that `ClientOptions`
//! starts from and that `gridctl` flags can override.

// ─── Cluster ────────────────────────────────────────────────────────────────

/// Default cluster name presented during authentication.
pub const DEFAULT_CLUSTER_NAME: &str = "dev";

/// Default member port.
pub const DEFAULT_MEMBER_PORT: u16 = 5701;

/// Serialization version the client speaks.
pub const SERIALIZATION_VERSION: u8 = 1;

// ─── Connection Retry ───────────────────────────────────────────────────────

/// Backoff before the second cluster connection round (milliseconds).
pub const DEFAULT_CONNECTION_INITIAL_BACKOFF_MS: u64 = 1_000;

/// Upper bound for the cluster connection backoff (milliseconds).
pub const DEFAULT_CONNECTION_MAX_BACKOFF_MS: u64 = 30_000;

/// Growth factor applied to the cluster connection backoff.
pub const DEFAULT_CONNECTION_BACKOFF_MULTIPLIER: f64 = 1.05;

/// Time budget for connecting to one cluster before failing over
/// (milliseconds, negative means unbounded).
pub const DEFAULT_CLUSTER_CONNECT_TIMEOUT_MS: i64 = 20_000;

/// Jitter applied to the cluster connection backoff, in `[0, 1]`.
pub const DEFAULT_CONNECTION_JITTER: f64 = 0.0;

/// Timeout for opening and authenticating one connection (milliseconds).
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;

/// Fixed delay before a failed member connection request is offered again
/// (milliseconds).
pub const DEFAULT_MEMBER_CONNECTION_RETRY_DELAY_MS: u64 = 1_000;

// ─── Failover ───────────────────────────────────────────────────────────────

/// Number of full rotations through the failover candidates.
pub const DEFAULT_FAILOVER_TRY_COUNT: usize = 1;

// ─── Messaging ──────────────────────────────────────────────────────────────

/// Total time an invocation may spend retrying (seconds).
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 120;

/// Number of retries performed without any delay.
pub const DEFAULT_MAX_FAST_INVOCATION_COUNT: u32 = 5;

/// Floor of the delay between slow retries (milliseconds).
pub const DEFAULT_MIN_RETRY_DELAY_MS: u64 = 1_000;

/// Timeout of one physical invocation attempt (milliseconds).
pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 120_000;

// ─── Heartbeat ──────────────────────────────────────────────────────────────

/// Interval between heartbeat checks (milliseconds).
pub const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 5_000;

/// Connections silent for this long are closed (milliseconds).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

// ─── Transport ──────────────────────────────────────────────────────────────

/// Maximum size of a single frame (bytes). 16 MB.
/// Protects against corrupt length prefixes on the wire.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Channel buffer size for connection events delivered to the orchestrator.
pub const DEFAULT_CONNECTION_EVENT_CHANNEL_SIZE: usize = 512;

/// Channel buffer size for broadcast notifications (state, membership).
pub const DEFAULT_NOTIFICATION_CHANNEL_SIZE: usize = 64;
