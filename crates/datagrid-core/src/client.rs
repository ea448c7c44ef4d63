//! Client facade.
//!
//! [`GridClient`] wires the connection layer together: it validates the
//! options, connects, runs the heartbeat, routes invocations, and exposes
//! the lifecycle, membership, and cluster-switch notifications.
//!
//! ```ignore
//! let client = GridClient::connect(options, Arc::new(TcpTransport::new())).await?;
//! let reply = client.invoke(ClientMessage::request("get", key), InvocationTarget::Partition(pid)).await?;
//! client.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::member::MemberInfo;
use datagrid_proto::message::{ClientMessage, MessageBody};
use datagrid_proto::state::ClientState;

use crate::clock::{tokio_clock, SharedClock};
use crate::cluster_connections::ClusterConnections;
use crate::cluster_members::{ClusterMembers, MembershipEvent};
use crate::cluster_state::{ClusterState, StateChange, StateHandler};
use crate::heartbeat::Heartbeat;
use crate::invocation::{Invocation, InvocationTarget};
use crate::messaging::ClusterMessaging;
use crate::options::{ClientOptions, ClusterOptions};
use crate::transport::Transport;

pub struct GridClient {
    state: Arc<ClusterState>,
    members: Arc<ClusterMembers>,
    connections: Arc<ClusterConnections>,
    messaging: ClusterMessaging,
    clock: SharedClock,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl GridClient {
    /// Build a client in the `Starting` state without connecting it, so
    /// that subscribers can be attached before [`start`](Self::start).
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        Self::with_clock(options, transport, tokio_clock())
    }

    pub fn with_clock(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> ClientResult<Self> {
        options.validate()?;
        let state = Arc::new(ClusterState::new(options.clone())?);
        let members = Arc::new(ClusterMembers::new(&options, clock.clone()));
        let connections =
            ClusterConnections::new(state.clone(), members.clone(), transport, clock.clone());
        let messaging = ClusterMessaging::new(state.clone(), members.clone(), clock.clone());
        let (heartbeat_stop, _) = watch::channel(false);
        Ok(Self {
            state,
            members,
            connections,
            messaging,
            clock,
            heartbeat_stop,
            heartbeat_task: Mutex::new(None),
        })
    }

    /// Build and start a client.
    pub async fn connect(options: ClientOptions, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        let client = Self::new(options, transport)?;
        client.start().await?;
        Ok(client)
    }

    /// Connect to the cluster. On failure the client is shut down.
    pub async fn start(&self) -> ClientResult<()> {
        self.state.change_state(ClientState::Started).await?;
        if let Err(e) = self.connections.connect().await {
            warn!("client: failed to start: {}", e);
            self.shutdown().await;
            return Err(e);
        }

        let heartbeat = Heartbeat::new(
            self.state.clone(),
            self.members.clone(),
            &self.state.options().heartbeat,
            self.clock.clone(),
        );
        *self.heartbeat_task.lock() = Some(heartbeat.start(self.heartbeat_stop.subscribe()));
        info!("client: {} started", self.state.client_name());
        Ok(())
    }

    /// Shut the client down. Idempotent.
    pub async fn shutdown(&self) {
        match self.state.change_state(ClientState::ShuttingDown).await {
            Ok(true) => {}
            // Already shutting down, or shut down by the connection layer.
            _ => {
                self.stop_background().await;
                return;
            }
        }
        self.stop_background().await;
        if let Err(e) = self.state.change_state(ClientState::ShutDown).await {
            warn!("client: {}", e);
        }
        info!("client: {} shut down", self.state.client_name());
    }

    async fn stop_background(&self) {
        self.heartbeat_stop.send_replace(true);
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.connections.dispose().await;
    }

    // ─── Invocations ─────────────────────────────────────────────────────────

    /// Build an invocation, for example to mark it retry-safe.
    pub fn invocation(&self, message: ClientMessage, target: InvocationTarget) -> Invocation {
        self.messaging.invocation(message, target)
    }

    pub async fn invoke(&self, message: ClientMessage, target: InvocationTarget) -> ClientResult<ClientMessage> {
        self.messaging.send(message, target).await
    }

    pub async fn invoke_on_member(&self, message: ClientMessage, member_id: Uuid) -> ClientResult<ClientMessage> {
        self.invoke(message, InvocationTarget::Member(member_id)).await
    }

    pub async fn invoke_on_partition(
        &self,
        message: ClientMessage,
        partition_id: i32,
    ) -> ClientResult<ClientMessage> {
        self.invoke(message, InvocationTarget::Partition(partition_id)).await
    }

    pub async fn send_invocation(&self, invocation: Invocation) -> ClientResult<ClientMessage> {
        self.messaging.invoke(invocation).await
    }

    /// Round-trip a ping through any connection.
    pub async fn ping(&self) -> ClientResult<Duration> {
        let start = self.clock.now();
        let invocation = self
            .invocation(ClientMessage::new(MessageBody::Ping), InvocationTarget::Any)
            .retry_safe();
        let reply = self.messaging.invoke(invocation).await?;
        match reply.body {
            MessageBody::Pong => Ok(self.clock.now().saturating_duration_since(start)),
            other => Err(ClientError::Codec(format!("unexpected ping reply: {:?}", other))),
        }
    }

    // ─── State and notifications ─────────────────────────────────────────────

    pub fn state(&self) -> ClientState {
        self.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn client_id(&self) -> Uuid {
        self.state.client_id()
    }

    pub fn cluster_id(&self) -> Option<Uuid> {
        self.connections.cluster_id()
    }

    /// Options of the cluster in use.
    pub fn cluster_options(&self) -> ClusterOptions {
        self.state.cluster_options()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.members()
    }

    pub fn connection_count(&self) -> usize {
        self.members.connection_count()
    }

    pub fn add_state_handler(&self, handler: StateHandler) {
        self.state.add_handler(handler);
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.watch()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.members.subscribe()
    }

    pub fn subscribe_cluster_changed(&self) -> broadcast::Receiver<ClusterOptions> {
        self.state.subscribe_cluster_changed()
    }
}
