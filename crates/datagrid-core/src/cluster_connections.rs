//! Cluster connection management.
//!
//! `ClusterConnections` establishes the first connection to a cluster
//! (rotating through failover candidates when a cluster stays unreachable)
//! and then runs two background tasks:
//!
//! - the member-connection loop, which drains the
//!   [`MemberConnectionQueue`](crate::connection_queue::MemberConnectionQueue)
//!   and opens connections to the members that need one, one at a time;
//! - the connection-event loop, the single writer of
//!   [`ClusterMembers`]: it applies pushed views and reacts to closed
//!   connections, reconnecting when the last one goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::groups::MemberGroups;
use datagrid_proto::member::MemberInfo;
use datagrid_proto::message::ServerEvent;
use datagrid_proto::state::ClientState;

use crate::clock::SharedClock;
use crate::cluster_members::{ClusterMembers, ConnectionRemoval};
use crate::cluster_state::ClusterState;
use crate::connection_queue::ConnectionRequests;
use crate::member_connection::{
    AuthenticationResult, ConnectionEvent, ConnectionEventSender, MemberConnection,
};
use crate::options::ReconnectMode;
use crate::retry::RetryStrategy;
use crate::transport::Transport;

pub struct ClusterConnections {
    state: Arc<ClusterState>,
    members: Arc<ClusterMembers>,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
    events_tx: ConnectionEventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Id of the cluster of the last successful cluster connection.
    cluster_id: Mutex<Option<Uuid>>,
}

impl ClusterConnections {
    pub fn new(
        state: Arc<ClusterState>,
        members: Arc<ClusterMembers>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            state,
            members,
            transport,
            clock,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            cluster_id: Mutex::new(None),
        })
    }

    /// Id of the cluster the client is (or was last) connected to.
    pub fn cluster_id(&self) -> Option<Uuid> {
        *self.cluster_id.lock()
    }

    /// Connect to a cluster and start the background loops.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or(ClientError::Unsupported("cluster connections already started"))?;
        self.transition(ClientState::Connecting).await?;
        self.connect_cluster().await?;

        let requests = self.members.queue().requests(self.shutdown.subscribe())?;
        let member_loop = tokio::spawn(self.clone().member_connection_loop(requests));
        let event_loop = tokio::spawn(self.clone().event_loop(events_rx));
        self.tasks.lock().extend([member_loop, event_loop]);

        self.members.queue().resume(false);
        self.members.request_missing_connections();
        Ok(())
    }

    /// Stop the loops and close every connection. Idempotent.
    pub async fn dispose(&self) {
        self.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("cluster: background task ended abnormally: {}", e);
            }
        }
    }

    fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!("cluster: stopping connection loops");
        self.members.queue().dispose();
        self.members.close_all(ClientError::ClientNotActive);
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn transition(&self, next: ClientState) -> ClientResult<bool> {
        match self.state.change_state(next).await {
            Err(_) if !self.state.is_active() => Err(ClientError::ClientNotActive),
            result => result,
        }
    }

    // ─── Cluster connection ──────────────────────────────────────────────────

    /// Connect to the current cluster, failing over while candidates
    /// remain. Must be called in the `Connecting` state. Returns whether
    /// the connected cluster differs from the previous one.
    async fn connect_cluster(&self) -> ClientResult<bool> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let cluster = self.state.cluster_options();
            let mut retry = RetryStrategy::from_options(
                format!("cluster {}", cluster.cluster_name),
                &self.state.options().connection_retry,
                self.clock.clone(),
            );
            info!("cluster: connecting to cluster {}", cluster.cluster_name);

            loop {
                for address in &cluster.addresses {
                    if self.is_stopped() {
                        return Err(ClientError::ClientNotActive);
                    }
                    match self.connect_to_cluster_member(*address).await {
                        Ok(changed) => return Ok(changed),
                        Err(e) if e.is_fatal() => {
                            error!("cluster: fatal error connecting to {}: {}", address, e);
                            return Err(e);
                        }
                        Err(e) => debug!("cluster: unable to connect to {}: {}", address, e),
                    }
                }

                tokio::select! {
                    more = retry.wait() => if !more { break },
                    _ = shutdown.changed() => return Err(ClientError::ClientNotActive),
                }
            }

            warn!("cluster: unable to connect to cluster {}", cluster.cluster_name);
            self.transition(ClientState::Disconnected).await?;
            if !self.state.failover_enabled() {
                return Err(ClientError::ClusterUnreachable);
            }
            self.transition(ClientState::Switching).await?;
            if !self.state.try_next_cluster()? {
                self.transition(ClientState::Disconnected).await?;
                return Err(ClientError::ClusterUnreachable);
            }
            self.transition(ClientState::Switched).await?;
            self.transition(ClientState::Connecting).await?;
        }
    }

    /// Open the first connection to a cluster through `address`.
    async fn connect_to_cluster_member(&self, address: SocketAddr) -> ClientResult<bool> {
        let (conn, auth) = self.open(address).await?;

        let previous = *self.cluster_id.lock();
        let changed = previous.map_or(false, |id| id != auth.cluster_id);
        if changed {
            info!(
                "cluster: connected to a new cluster {} (was {:?})",
                auth.cluster_id, previous
            );
            if let Err(e) = self.members.set_partition_count(auth.partition_count) {
                error!("cluster: rejecting cluster {}: {}", auth.cluster_id, e);
                conn.close(e.clone());
                return Err(e);
            }
            self.members.reset_for_new_cluster();
        }

        if let Err(e) = self.register(&conn, auth.partition_count, auth.member_groups.as_ref()) {
            conn.close(e.clone());
            return Err(e);
        }
        *self.cluster_id.lock() = Some(auth.cluster_id);
        self.state.reset_failover();

        if changed {
            self.transition(ClientState::ClusterChanged).await?;
        }
        self.transition(ClientState::Connected).await?;
        info!(
            "cluster: connected to member {} at {} (version {})",
            auth.member_id, auth.member_address, auth.server_version
        );
        Ok(changed)
    }

    async fn open(&self, address: SocketAddr) -> ClientResult<(Arc<MemberConnection>, AuthenticationResult)> {
        let conn = MemberConnection::new(address, self.events_tx.clone(), self.clock.clone());
        let auth = conn
            .connect(
                self.transport.as_ref(),
                self.state.authentication_request(),
                self.state.next_correlation_id(),
                Duration::from_millis(self.state.options().connection_timeout_ms),
            )
            .await?;
        Ok((conn, auth))
    }

    /// Record what the member told us and start using the connection.
    fn register(
        &self,
        conn: &Arc<MemberConnection>,
        partition_count: i32,
        member_groups: Option<&MemberGroups>,
    ) -> ClientResult<bool> {
        self.members.set_partition_count(partition_count)?;
        if let Some(groups) = member_groups {
            self.members.set_member_groups(groups);
        }
        if !self.members.add_connection(conn.clone())? {
            debug!("cluster: member {:?} is already connected", conn.member_id());
            conn.close(ClientError::NotConnected);
            return Ok(false);
        }
        conn.activate()?;
        Ok(true)
    }

    // ─── Member connections ──────────────────────────────────────────────────

    async fn member_connection_loop(self: Arc<Self>, mut requests: ConnectionRequests) {
        loop {
            let request = match requests.next().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    error!("cluster: member connection loop failed: {}", e);
                    break;
                }
            };

            let member = request.member().clone();
            if self.members.has_connection(&member.id) {
                request.complete(true);
                continue;
            }
            match self.connect_to_member(&member).await {
                Ok(()) => request.complete(true),
                Err(e) => {
                    debug!("cluster: unable to connect to {}: {}", member, e);
                    request.complete(false);
                }
            }
        }
        debug!("cluster: member connection loop stopped");
    }

    async fn connect_to_member(&self, member: &MemberInfo) -> ClientResult<()> {
        let (conn, auth) = self.open(member.address).await?;

        let result = if Some(auth.cluster_id) != self.cluster_id() {
            Err(ClientError::TopologyConflict(format!(
                "{} belongs to cluster {}",
                member, auth.cluster_id
            )))
        } else if auth.member_id != member.id {
            Err(ClientError::TopologyConflict(format!(
                "{} answered as member {}",
                member, auth.member_id
            )))
        } else {
            self.register(&conn, auth.partition_count, auth.member_groups.as_ref())
                .map(|_| ())
        };
        if let Err(e) = &result {
            conn.close(e.clone());
        }
        result
    }

    // ─── Connection events ───────────────────────────────────────────────────

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
            if self.is_stopped() {
                break;
            }
        }
        debug!("cluster: connection event loop stopped");
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Event {
                connection_id,
                member_id,
                event,
            } => {
                let registered = self
                    .members
                    .get_connection(&member_id)
                    .map_or(false, |conn| conn.id() == connection_id);
                if !registered {
                    debug!("cluster: dropping event from unregistered connection {}", connection_id);
                    return;
                }
                self.apply(event);
            }
            ConnectionEvent::Closed {
                connection_id,
                member_id,
                address,
                reason,
            } => {
                info!("cluster: connection to {} closed: {}", address, reason);
                match self.members.remove_connection(&member_id, &connection_id) {
                    ConnectionRemoval::NotRegistered => {}
                    ConnectionRemoval::Removed => {
                        if let Some(member) = self.members.member(&member_id) {
                            self.members.queue().add(member);
                        }
                    }
                    ConnectionRemoval::LastRemoved => self.handle_disconnected().await,
                }
            }
        }
    }

    fn apply(&self, event: ServerEvent) {
        match event {
            ServerEvent::MembersView { version, members } => {
                self.members.set_members(version, members);
            }
            ServerEvent::PartitionsView {
                version,
                partitions,
            } => {
                self.members.set_partitions(version, partitions);
            }
            ServerEvent::ClusterVersion(version) => {
                info!("cluster: cluster version is now {}", version);
            }
            ServerEvent::MemberGroupsView(groups) => {
                self.members.set_member_groups(&groups);
            }
        }
    }

    /// The last connection closed: reconnect, or shut down when
    /// reconnecting is off or impossible.
    async fn handle_disconnected(&self) {
        if !self.state.is_active() {
            return;
        }
        if let Err(e) = self.transition(ClientState::Disconnected).await {
            warn!("cluster: {}", e);
            return;
        }
        self.members.queue().suspend().await;

        if self.state.options().reconnect_mode == ReconnectMode::Off {
            info!("cluster: disconnected and reconnect mode is off, shutting down");
            self.shut_down().await;
            return;
        }

        let result = match self.transition(ClientState::Connecting).await {
            Ok(_) => self.connect_cluster().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(changed) => {
                self.members.queue().resume(changed);
                self.members.request_missing_connections();
            }
            Err(ClientError::ClientNotActive) => {}
            Err(e) => {
                error!("cluster: unable to reconnect: {}", e);
                self.shut_down().await;
            }
        }
    }

    async fn shut_down(&self) {
        if self.transition(ClientState::ShuttingDown).await.is_err() {
            return;
        }
        self.stop();
        let _ = self.transition(ClientState::ShutDown).await;
    }
}
