//! Client lifecycle state and the options of the cluster in use.
//!
//! Every state change goes through [`ClusterState::change_state`], which
//! holds a single transition lock while it validates the edge, refreshes
//! the current cluster options when switching clusters, and notifies
//! subscribers. Handlers therefore observe changes one at a time and in
//! order.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use datagrid_proto::defaults::{DEFAULT_NOTIFICATION_CHANNEL_SIZE, SERIALIZATION_VERSION};
use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::AuthenticationRequest;
use datagrid_proto::state::ClientState;

use crate::failover::Failover;
use crate::options::{ClientOptions, ClusterOptions};

/// A committed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ClientState,
    pub current: ClientState,
}

/// Synchronous state-change handler. Runs under the transition lock.
pub type StateHandler = Box<dyn Fn(&StateChange) + Send + Sync>;

pub struct ClusterState {
    client_id: Uuid,
    client_name: String,
    options: ClientOptions,
    transition: tokio::sync::Mutex<()>,
    state: watch::Sender<ClientState>,
    failover: Mutex<Failover>,
    cluster: RwLock<ClusterOptions>,
    correlation_id: AtomicI64,
    handlers: Mutex<Vec<StateHandler>>,
    changes: broadcast::Sender<StateChange>,
}

impl ClusterState {
    pub fn new(options: ClientOptions) -> ClientResult<Self> {
        let failover = Failover::from_options(&options)?;
        let cluster = failover.current_options().clone();
        let (state, _) = watch::channel(ClientState::Starting);
        let (changes, _) = broadcast::channel(DEFAULT_NOTIFICATION_CHANNEL_SIZE);
        Ok(Self {
            client_id: Uuid::new_v4(),
            client_name: options.client_name.clone(),
            options,
            transition: tokio::sync::Mutex::new(()),
            state,
            failover: Mutex::new(failover),
            cluster: RwLock::new(cluster),
            correlation_id: AtomicI64::new(0),
            handlers: Mutex::new(Vec::new()),
            changes,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Process-wide options (from the primary configuration).
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Options of the cluster currently in use.
    pub fn cluster_options(&self) -> ClusterOptions {
        self.cluster.read().clone()
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Authentication request for the current cluster.
    pub fn authentication_request(&self) -> AuthenticationRequest {
        let cluster = self.cluster.read();
        AuthenticationRequest {
            cluster_name: cluster.cluster_name.clone(),
            credentials: cluster.credentials.clone(),
            client_id: self.client_id,
            client_name: self.client_name.clone(),
            serialization_version: SERIALIZATION_VERSION,
        }
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` when already in `next`, and fails on edges the
    /// lifecycle does not allow.
    pub async fn change_state(&self, next: ClientState) -> ClientResult<bool> {
        let _guard = self.transition.lock().await;

        let previous = self.state();
        if previous == next {
            return Ok(false);
        }
        if !previous.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                from: previous,
                to: next,
            });
        }

        if next == ClientState::Switched {
            let selected = self.failover.lock().current_options().clone();
            *self.cluster.write() = selected;
        }

        self.state.send_replace(next);
        info!("client: {} -> {}", previous, next);

        let change = StateChange {
            previous,
            current: next,
        };
        for handler in self.handlers.lock().iter() {
            handler(&change);
        }
        let _ = self.changes.send(change);
        Ok(true)
    }

    /// Select the next failover candidate. Only legal while switching.
    pub fn try_next_cluster(&self) -> ClientResult<bool> {
        let state = self.state();
        if state != ClientState::Switching {
            return Err(ClientError::InvalidTransition {
                from: state,
                to: ClientState::Switched,
            });
        }
        Ok(self.failover.lock().try_next_cluster())
    }

    pub fn reset_failover(&self) {
        self.failover.lock().reset();
    }

    pub fn failover_enabled(&self) -> bool {
        self.failover.lock().is_enabled()
    }

    /// Register a handler invoked, in registration order, for every change.
    pub fn add_handler(&self, handler: StateHandler) {
        self.handlers.lock().push(handler);
    }

    /// Stream of state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Latest-state view, for waiting on a particular state.
    pub fn watch(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Stream of cluster switches made by failover.
    pub fn subscribe_cluster_changed(&self) -> broadcast::Receiver<ClusterOptions> {
        self.failover.lock().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ClientState::*;

    fn failover_options() -> ClientOptions {
        let mut options = ClientOptions::default();
        options.cluster.cluster_name = "primary".into();
        options.failover.enabled = true;
        options
            .failover
            .clusters
            .push(ClusterOptions::new("backup", vec!["10.0.0.1:5701".parse().unwrap()]));
        options
    }

    #[tokio::test]
    async fn test_lifecycle_edges() {
        let state = ClusterState::new(ClientOptions::default()).unwrap();
        assert_eq!(state.state(), Starting);
        assert!(state.change_state(Started).await.unwrap());
        assert!(state.change_state(Connecting).await.unwrap());
        assert!(!state.change_state(Connecting).await.unwrap());
        assert!(state.change_state(Connected).await.unwrap());
        assert!(state.is_connected());

        assert_eq!(
            state.change_state(Switching).await.unwrap_err(),
            ClientError::InvalidTransition {
                from: Connected,
                to: Switching
            }
        );

        state.change_state(ShuttingDown).await.unwrap();
        assert!(!state.is_active());
        assert!(state.change_state(Connecting).await.is_err());
        state.change_state(ShutDown).await.unwrap();
        assert!(state.change_state(ShuttingDown).await.is_err());
    }

    #[tokio::test]
    async fn test_handlers_run_in_order() {
        let state = ClusterState::new(ClientOptions::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            state.add_handler(Box::new(move |change| {
                seen.lock().push((tag, change.current));
            }));
        }
        let mut rx = state.subscribe();

        state.change_state(Started).await.unwrap();
        state.change_state(Connecting).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![("a", Started), ("b", Started), ("a", Connecting), ("b", Connecting)]
        );
        assert_eq!(rx.recv().await.unwrap().current, Started);
        let change = rx.recv().await.unwrap();
        assert_eq!((change.previous, change.current), (Started, Connecting));
    }

    #[tokio::test]
    async fn test_switching_refreshes_cluster_options() {
        let state = ClusterState::new(failover_options()).unwrap();
        let mut switched = state.subscribe_cluster_changed();
        assert_eq!(state.cluster_options().cluster_name, "primary");
        assert!(state.try_next_cluster().is_err());

        for next in [Started, Connecting, Disconnected, Switching] {
            state.change_state(next).await.unwrap();
        }
        assert!(state.try_next_cluster().unwrap());
        // not applied until the switch completes
        assert_eq!(state.cluster_options().cluster_name, "primary");
        state.change_state(Switched).await.unwrap();
        assert_eq!(state.cluster_options().cluster_name, "backup");
        assert_eq!(state.authentication_request().cluster_name, "backup");
        assert_eq!(switched.recv().await.unwrap().cluster_name, "backup");
    }

    #[tokio::test]
    async fn test_correlation_ids_increase() {
        let state = ClusterState::new(ClientOptions::default()).unwrap();
        let a = state.next_correlation_id();
        let b = state.next_correlation_id();
        assert!(b > a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_are_serialized() {
        use std::sync::atomic::AtomicBool;

        for _ in 0..50 {
            let state = Arc::new(ClusterState::new(ClientOptions::default()).unwrap());
            for next in [Started, Connecting, Connected] {
                state.change_state(next).await.unwrap();
            }

            let in_handler = Arc::new(AtomicBool::new(false));
            let seen = Arc::new(Mutex::new(Vec::new()));
            let (flag, sink) = (in_handler.clone(), seen.clone());
            state.add_handler(Box::new(move |change| {
                assert!(!flag.swap(true, Ordering::SeqCst), "overlapping handlers");
                sink.lock().push(*change);
                std::thread::sleep(std::time::Duration::from_micros(50));
                flag.store(false, Ordering::SeqCst);
            }));
            let mut stream = state.subscribe();

            let closer = {
                let state = state.clone();
                tokio::spawn(async move {
                    for next in [Disconnected, Connecting, Connected, Disconnected, Connecting] {
                        let _ = state.change_state(next).await;
                    }
                })
            };
            let shutter = {
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    state.change_state(ShuttingDown).await.unwrap();
                    state.change_state(ShutDown).await.unwrap();
                })
            };
            closer.await.unwrap();
            shutter.await.unwrap();

            let seen = seen.lock().clone();
            let mut current = Connected;
            for change in &seen {
                assert_eq!(change.previous, current);
                assert!(change.previous.can_transition_to(change.current));
                current = change.current;
            }
            assert_eq!(current, ShutDown);
            assert_eq!(state.state(), ShutDown);

            for change in &seen {
                assert_eq!(stream.recv().await.unwrap(), *change);
            }
        }
    }
}
