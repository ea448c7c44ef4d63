//! Membership, partition ownership, and the live connection registry.
//!
//! Views pushed by members are applied here by a single writer (the
//! connection-event loop of `ClusterConnections`). Applying a view keeps
//! the load balancer, the member connection queue, and the partition group
//! in line with the member table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use datagrid_proto::defaults::DEFAULT_NOTIFICATION_CHANNEL_SIZE;
use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::groups::MemberGroups;
use datagrid_proto::member::MemberInfo;

use crate::clock::SharedClock;
use crate::connection_queue::MemberConnectionQueue;
use crate::load_balancer::{self, LoadBalancer};
use crate::member_connection::MemberConnection;
use crate::options::{ClientOptions, RoutingMode};
use crate::partition_group::MemberPartitionGroup;

/// Members that joined or left with a membership view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub version: i32,
    pub added: Vec<MemberInfo>,
    pub removed: Vec<MemberInfo>,
}

/// Outcome of [`ClusterMembers::remove_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRemoval {
    /// The connection was not (or no longer) registered.
    NotRegistered,
    Removed,
    /// The connection was the last one.
    LastRemoved,
}

#[derive(Default)]
struct Tables {
    members_version: Option<i32>,
    members: Vec<MemberInfo>,
    partitions_version: Option<i32>,
    partition_count: Option<i32>,
    owners: HashMap<i32, Uuid>,
}

impl Tables {
    fn member(&self, id: &Uuid) -> Option<&MemberInfo> {
        self.members.iter().find(|m| &m.id == id)
    }
}

/// State the queue inclusion predicate needs.
#[derive(Clone)]
struct Registry {
    routing: RoutingMode,
    tables: Arc<RwLock<Tables>>,
    connections: Arc<DashMap<Uuid, Arc<MemberConnection>>>,
    partition_group: Arc<MemberPartitionGroup>,
}

impl Registry {
    fn needs_connection(&self, member: &MemberInfo) -> bool {
        if self.connections.contains_key(&member.id) {
            return false;
        }
        if self.tables.read().member(&member.id).is_none() {
            return false;
        }
        match self.routing {
            RoutingMode::AllMembers => true,
            RoutingMode::SingleMember => false,
            RoutingMode::MultiMember => self.partition_group.contains(&member.id),
        }
    }
}

/// Owner of the member table and the member connections.
pub struct ClusterMembers {
    registry: Registry,
    load_balancer: Box<dyn LoadBalancer>,
    queue: MemberConnectionQueue,
    events: broadcast::Sender<MembershipEvent>,
}

impl ClusterMembers {
    pub fn new(options: &ClientOptions, clock: SharedClock) -> Self {
        let registry = Registry {
            routing: options.routing,
            tables: Arc::new(RwLock::new(Tables::default())),
            connections: Arc::new(DashMap::new()),
            partition_group: Arc::new(MemberPartitionGroup::new()),
        };
        let predicate = registry.clone();
        let queue = MemberConnectionQueue::new(
            Duration::from_millis(options.member_connection_retry_delay_ms),
            clock,
            Box::new(move |member| predicate.needs_connection(member)),
        );
        let (events, _) = broadcast::channel(DEFAULT_NOTIFICATION_CHANNEL_SIZE);
        Self {
            registry,
            load_balancer: load_balancer::from_kind(options.load_balancer),
            queue,
            events,
        }
    }

    pub fn routing(&self) -> RoutingMode {
        self.registry.routing
    }

    pub fn queue(&self) -> &MemberConnectionQueue {
        &self.queue
    }

    pub fn partition_group(&self) -> &MemberPartitionGroup {
        &self.registry.partition_group
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    // ─── Members ─────────────────────────────────────────────────────────────

    /// Apply a membership view. Returns the resulting event, or `None` if
    /// the view is stale.
    pub fn set_members(&self, version: i32, members: Vec<MemberInfo>) -> Option<MembershipEvent> {
        let (added, removed) = {
            let mut tables = self.registry.tables.write();
            if tables.members_version.map_or(false, |current| version <= current) {
                debug!(
                    "members: ignoring stale view {} (current {:?})",
                    version, tables.members_version
                );
                return None;
            }

            let new_ids: HashSet<Uuid> = members.iter().map(|m| m.id).collect();
            let removed: Vec<MemberInfo> = tables
                .members
                .iter()
                .filter(|m| !new_ids.contains(&m.id))
                .cloned()
                .collect();
            let added: Vec<MemberInfo> = members
                .iter()
                .filter(|m| tables.member(&m.id).is_none())
                .cloned()
                .collect();

            tables.members_version = Some(version);
            tables.members = members;
            (added, removed)
        };

        let ids: Vec<Uuid> = self.members().iter().map(|m| m.id).collect();
        if let Err(e) = self.load_balancer.notify_members(&ids) {
            debug!("members: {} load balancer ignores membership: {}", self.load_balancer.name(), e);
        }

        for member in &removed {
            info!("members: {} left", member);
            self.queue.remove(&member.id);
            self.registry.partition_group.remove_subset_member(&member.id);
            if let Some((_, conn)) = self.registry.connections.remove(&member.id) {
                conn.close(ClientError::TargetDisconnected {
                    address: member.address.to_string(),
                });
            }
        }
        for member in &added {
            info!("members: {} joined", member);
        }
        self.request_missing_connections();

        let event = MembershipEvent {
            version,
            added,
            removed,
        };
        let _ = self.events.send(event.clone());
        Some(event)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.registry.tables.read().members.clone()
    }

    pub fn member(&self, id: &Uuid) -> Option<MemberInfo> {
        self.registry.tables.read().member(id).cloned()
    }

    pub fn members_version(&self) -> Option<i32> {
        self.registry.tables.read().members_version
    }

    /// Queue a connection request for every member that needs one.
    pub fn request_missing_connections(&self) {
        for member in self.members() {
            self.queue.add(member);
        }
    }

    // ─── Partitions ──────────────────────────────────────────────────────────

    /// Record the partition count reported by a member.
    ///
    /// The count is fixed for the life of the client, across failovers; a
    /// different count is a topology conflict.
    pub fn set_partition_count(&self, count: i32) -> ClientResult<()> {
        let mut tables = self.registry.tables.write();
        match tables.partition_count {
            Some(current) if current != count => Err(ClientError::TopologyConflict(format!(
                "partition count changed from {} to {}",
                current, count
            ))),
            _ => {
                tables.partition_count = Some(count);
                Ok(())
            }
        }
    }

    pub fn partition_count(&self) -> Option<i32> {
        self.registry.tables.read().partition_count
    }

    /// Apply a partition view. Returns `false` if it is stale.
    pub fn set_partitions(&self, version: i32, partitions: Vec<(Uuid, Vec<i32>)>) -> bool {
        let mut tables = self.registry.tables.write();
        if tables.partitions_version.map_or(false, |current| version <= current) {
            debug!("members: ignoring stale partition view {}", version);
            return false;
        }
        tables.partitions_version = Some(version);
        tables.owners = partitions
            .into_iter()
            .flat_map(|(owner, ids)| ids.into_iter().map(move |pid| (pid, owner)))
            .collect();
        debug!(
            "members: partition view {} with {} owned partitions",
            version,
            tables.owners.len()
        );
        true
    }

    pub fn partition_owner(&self, partition_id: i32) -> Option<Uuid> {
        self.registry.tables.read().owners.get(&partition_id).copied()
    }

    // ─── Member groups ───────────────────────────────────────────────────────

    /// Apply a member-group view and request connections for the selected
    /// group. Returns `false` if the view was ignored.
    pub fn set_member_groups(&self, groups: &MemberGroups) -> bool {
        let accepted = self.registry.partition_group.set_subset_members(groups);
        if accepted && self.registry.routing == RoutingMode::MultiMember {
            self.request_missing_connections();
        }
        accepted
    }

    // ─── Connections ─────────────────────────────────────────────────────────

    /// Register an authenticated connection. Returns `false` if the member
    /// already has an active connection.
    pub fn add_connection(&self, conn: Arc<MemberConnection>) -> ClientResult<bool> {
        let member_id = conn.member_id().ok_or(ClientError::NotConnected)?;
        match self.registry.connections.entry(member_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(false);
                }
                entry.insert(conn);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(conn);
            }
        }
        self.queue.remove(&member_id);
        Ok(true)
    }

    /// Unregister a connection, unless a newer one replaced it.
    pub fn remove_connection(&self, member_id: &Uuid, connection_id: &Uuid) -> ConnectionRemoval {
        let removed = self
            .registry
            .connections
            .remove_if(member_id, |_, conn| &conn.id() == connection_id)
            .is_some();
        if !removed {
            ConnectionRemoval::NotRegistered
        } else if self.registry.connections.is_empty() {
            ConnectionRemoval::LastRemoved
        } else {
            ConnectionRemoval::Removed
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connections.len()
    }

    pub fn has_connection(&self, member_id: &Uuid) -> bool {
        self.registry.connections.contains_key(member_id)
    }

    pub fn connections(&self) -> Vec<Arc<MemberConnection>> {
        self.registry
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether `member` should get a connection under the routing mode.
    pub fn needs_connection(&self, member: &MemberInfo) -> bool {
        self.registry.needs_connection(member)
    }

    pub fn get_connection(&self, member_id: &Uuid) -> Option<Arc<MemberConnection>> {
        self.registry
            .connections
            .get(member_id)
            .map(|entry| entry.value().clone())
            .filter(|conn| conn.is_active())
    }

    /// A connection picked by the load balancer, or any active one.
    pub fn get_random_connection(&self) -> Option<Arc<MemberConnection>> {
        if self.registry.routing != RoutingMode::SingleMember {
            if let Ok(member_id) = self.load_balancer.get_member() {
                if let Some(conn) = self.get_connection(&member_id) {
                    return Some(conn);
                }
            }
        }
        self.registry
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .find(|conn| conn.is_active())
    }

    /// Connection to the owner of `partition_id`, if connected.
    pub fn get_connection_for_partition(&self, partition_id: i32) -> Option<Arc<MemberConnection>> {
        self.partition_owner(partition_id)
            .and_then(|owner| self.get_connection(&owner))
    }

    /// Close every connection, for example on shutdown.
    pub fn close_all(&self, reason: ClientError) {
        let connections = self.connections();
        self.registry.connections.clear();
        for conn in connections {
            conn.close(reason.clone());
        }
    }

    /// Forget the members, partitions and groups of the previous cluster.
    /// The partition count is kept.
    pub fn reset_for_new_cluster(&self) {
        let mut tables = self.registry.tables.write();
        if tables.members_version.is_some() {
            warn!("members: cluster changed, clearing member and partition tables");
        }
        *tables = Tables {
            partition_count: tables.partition_count,
            ..Tables::default()
        };
        drop(tables);
        self.registry.partition_group.clear();
    }
}
