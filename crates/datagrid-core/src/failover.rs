//! Rotation through alternate cluster configurations.

use tokio::sync::broadcast;
use tracing::{info, warn};

use datagrid_proto::defaults::DEFAULT_NOTIFICATION_CHANNEL_SIZE;
use datagrid_proto::error::{ClientError, ClientResult};

use crate::options::{ClientOptions, ClusterOptions};

/// Cluster candidates and the try budget for switching between them.
///
/// The first candidate is the primary cluster and the starting point.
/// Each [`try_next_cluster`](Self::try_next_cluster) moves one step forward,
/// wrapping around, until `try_count` full rotations have been spent.
pub struct Failover {
    enabled: bool,
    candidates: Vec<ClusterOptions>,
    try_count: usize,
    index: usize,
    current_try_count: usize,
    changed: broadcast::Sender<ClusterOptions>,
}

impl Failover {
    pub fn new(enabled: bool, candidates: Vec<ClusterOptions>, try_count: usize) -> ClientResult<Self> {
        if candidates.is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "failover requires at least one cluster".into(),
            ));
        }
        let (changed, _) = broadcast::channel(DEFAULT_NOTIFICATION_CHANNEL_SIZE);
        Ok(Self {
            enabled,
            candidates,
            try_count,
            index: 0,
            current_try_count: 0,
            changed,
        })
    }

    pub fn from_options(options: &ClientOptions) -> ClientResult<Self> {
        Self::new(
            options.failover.enabled,
            options.cluster_candidates(),
            options.failover.try_count,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_options(&self) -> &ClusterOptions {
        &self.candidates[self.index]
    }

    pub fn current_try_count(&self) -> usize {
        self.current_try_count
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Move to the next candidate. Returns `false`, leaving the current
    /// candidate in place, once the try budget is spent.
    pub fn try_next_cluster(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let budget = self.try_count.saturating_mul(self.candidates.len());
        if self.current_try_count >= budget {
            warn!(
                "failover: exhausted {} attempts over {} clusters",
                budget,
                self.candidates.len()
            );
            return false;
        }

        self.current_try_count += 1;
        self.index = (self.index + 1) % self.candidates.len();
        let next = self.candidates[self.index].clone();
        info!(
            "failover: switching to cluster {} (attempt {})",
            next.cluster_name, self.current_try_count
        );
        let _ = self.changed.send(next);
        true
    }

    /// Forget spent attempts after a successful connection.
    pub fn reset(&mut self) {
        self.current_try_count = 0;
    }

    /// Subscribe to cluster switches.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterOptions> {
        self.changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> ClusterOptions {
        ClusterOptions::new(name, vec!["127.0.0.1:5701".parse().unwrap()])
    }

    #[test]
    fn test_rotation_then_exhausted() {
        let mut failover = Failover::new(true, vec![cluster("c1"), cluster("c2")], 2).unwrap();
        assert_eq!(failover.current_options().cluster_name, "c1");

        let mut visited = Vec::new();
        while failover.try_next_cluster() {
            visited.push(failover.current_options().cluster_name.clone());
        }
        assert_eq!(visited, ["c2", "c1", "c2", "c1"]);
        // unchanged after exhaustion
        assert_eq!(failover.current_options().cluster_name, "c1");
        assert!(!failover.try_next_cluster());
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut failover = Failover::new(true, vec![cluster("c1"), cluster("c2")], 1).unwrap();
        assert!(failover.try_next_cluster());
        assert!(failover.try_next_cluster());
        assert!(!failover.try_next_cluster());
        failover.reset();
        assert!(failover.try_next_cluster());
        assert_eq!(failover.current_options().cluster_name, "c2");
    }

    #[test]
    fn test_disabled_never_advances() {
        let mut failover = Failover::new(false, vec![cluster("c1")], 3).unwrap();
        assert!(!failover.try_next_cluster());
        assert_eq!(failover.current_options().cluster_name, "c1");
    }

    #[test]
    fn test_requires_candidates() {
        assert!(matches!(
            Failover::new(true, Vec::new(), 1),
            Err(ClientError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_switch_is_broadcast() {
        let mut failover = Failover::new(true, vec![cluster("c1"), cluster("c2")], 1).unwrap();
        let mut rx = failover.subscribe();
        failover.try_next_cluster();
        assert_eq!(rx.recv().await.unwrap().cluster_name, "c2");
    }
}
