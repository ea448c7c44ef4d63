//! Client options.
//!
//! Options are plain serde structs starting from the defaults in
//! [`datagrid_proto::defaults`]. Cluster-scoped settings live in
//! [`ClusterOptions`] and are replaced per failover candidate; everything
//! else is process-wide and fixed by the primary configuration.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use datagrid_proto::defaults::*;
use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::Credentials;

/// Cluster-scoped options, one per failover candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub cluster_name: String,
    pub addresses: Vec<SocketAddr>,
    pub credentials: Credentials,
}

impl ClusterOptions {
    pub fn new(cluster_name: impl Into<String>, addresses: Vec<SocketAddr>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            addresses,
            credentials: Credentials::None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::new(
            DEFAULT_CLUSTER_NAME,
            vec![SocketAddr::from(([127, 0, 0, 1], DEFAULT_MEMBER_PORT))],
        )
    }
}

/// Backoff settings for cluster connection rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Budget for one cluster before failing over; negative is unbounded.
    pub cluster_connect_timeout_ms: i64,
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_CONNECTION_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_CONNECTION_MAX_BACKOFF_MS,
            multiplier: DEFAULT_CONNECTION_BACKOFF_MULTIPLIER,
            cluster_connect_timeout_ms: DEFAULT_CLUSTER_CONNECT_TIMEOUT_MS,
            jitter: DEFAULT_CONNECTION_JITTER,
        }
    }
}

/// Invocation retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingOptions {
    pub retry_timeout_secs: u64,
    pub max_fast_invocation_count: u32,
    pub min_retry_delay_ms: u64,
    pub invocation_timeout_ms: u64,
    /// Retry invocations whose target disconnected, even if they are not
    /// marked retry-safe.
    pub redo_operations: bool,
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self {
            retry_timeout_secs: DEFAULT_RETRY_TIMEOUT_SECS,
            max_fast_invocation_count: DEFAULT_MAX_FAST_INVOCATION_COUNT,
            min_retry_delay_ms: DEFAULT_MIN_RETRY_DELAY_MS,
            invocation_timeout_ms: DEFAULT_INVOCATION_TIMEOUT_MS,
            redo_operations: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatOptions {
    pub period_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverOptions {
    pub enabled: bool,
    /// Number of full rotations through the candidates.
    pub try_count: usize,
    /// Alternate clusters, tried after the primary one.
    pub clusters: Vec<ClusterOptions>,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            try_count: DEFAULT_FAILOVER_TRY_COUNT,
            clusters: Vec::new(),
        }
    }
}

/// Which members the client keeps connections to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingMode {
    /// Connect to every member ("smart" routing).
    #[default]
    AllMembers,
    /// Keep a single gateway connection.
    SingleMember,
    /// Connect to the members of the selected partition group only.
    MultiMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    Random,
    Static(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReconnectMode {
    Off,
    #[default]
    On,
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub client_name: String,
    /// Primary cluster.
    pub cluster: ClusterOptions,
    pub failover: FailoverOptions,
    pub connection_retry: RetryOptions,
    pub connection_timeout_ms: u64,
    /// Fixed delay before a failed member connection is attempted again.
    pub member_connection_retry_delay_ms: u64,
    pub messaging: MessagingOptions,
    pub heartbeat: HeartbeatOptions,
    pub routing: RoutingMode,
    pub load_balancer: LoadBalancerKind,
    pub reconnect_mode: ReconnectMode,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: format!("client-{}", Uuid::new_v4().simple()),
            cluster: ClusterOptions::default(),
            failover: FailoverOptions::default(),
            connection_retry: RetryOptions::default(),
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            member_connection_retry_delay_ms: DEFAULT_MEMBER_CONNECTION_RETRY_DELAY_MS,
            messaging: MessagingOptions::default(),
            heartbeat: HeartbeatOptions::default(),
            routing: RoutingMode::default(),
            load_balancer: LoadBalancerKind::default(),
            reconnect_mode: ReconnectMode::default(),
        }
    }
}

impl ClientOptions {
    /// Ordered failover candidates: the primary cluster first.
    pub fn cluster_candidates(&self) -> Vec<ClusterOptions> {
        let mut candidates = vec![self.cluster.clone()];
        if self.failover.enabled {
            candidates.extend(self.failover.clusters.iter().cloned());
        }
        candidates
    }

    /// Reject inconsistent options before anything is started.
    pub fn validate(&self) -> ClientResult<()> {
        for cluster in self.cluster_candidates() {
            if cluster.cluster_name.is_empty() {
                return Err(ClientError::InvalidConfiguration(
                    "cluster name must not be empty".into(),
                ));
            }
            if cluster.addresses.is_empty() {
                return Err(ClientError::InvalidConfiguration(format!(
                    "cluster {} has no addresses",
                    cluster.cluster_name
                )));
            }
        }

        if self.failover.enabled {
            if self.failover.clusters.is_empty() {
                return Err(ClientError::InvalidConfiguration(
                    "failover is enabled but no alternate clusters are configured".into(),
                ));
            }
            if self.failover.try_count == 0 {
                return Err(ClientError::InvalidConfiguration(
                    "failover try count must be at least 1".into(),
                ));
            }
        }

        let retry = &self.connection_retry;
        if retry.multiplier < 1.0 {
            return Err(ClientError::InvalidConfiguration(
                "connection retry multiplier must be >= 1".into(),
            ));
        }
        if retry.initial_backoff_ms == 0 {
            return Err(ClientError::InvalidConfiguration(
                "connection retry initial backoff must be > 0".into(),
            ));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ClientError::InvalidConfiguration(
                "initial backoff exceeds max backoff".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ClientError::InvalidConfiguration(
                "connection retry jitter must be within [0, 1]".into(),
            ));
        }

        if self.heartbeat.period_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.period_ms {
            return Err(ClientError::InvalidConfiguration(
                "heartbeat timeout must exceed a non-zero heartbeat period".into(),
            ));
        }

        Ok(())
    }
}
