//! In-process stub members.
//!
//! A [`StubCluster`] answers the member side of the protocol well enough to
//! exercise the connection layer without real servers: it authenticates
//! clients, pushes membership/partition/member-group views, answers pings,
//! and echoes requests. Members can be stopped, restarted, added, and
//! removed, and requests can be scripted to fail.
//!
//! It is reachable in-process through
//! [`MemoryTransport`](crate::memory_transport::MemoryTransport) or over TCP
//! through [`TcpStubListener`](crate::tcp_transport::TcpStubListener).

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use datagrid_proto::defaults::SERIALIZATION_VERSION;
use datagrid_proto::error::{ClientError, ClientResult, ErrorCode};
use datagrid_proto::groups::MemberGroups;
use datagrid_proto::member::{MemberInfo, MemberVersion};
use datagrid_proto::message::{
    AuthenticationRequest, AuthenticationResponse, AuthenticationStatus, ClientMessage,
    Credentials, MessageBody, ServerEvent,
};

use crate::transport::Channel;

/// Version reported by stub members.
pub const STUB_VERSION: MemberVersion = MemberVersion::new(5, 4, 0);

/// Default partition count of a stub cluster.
pub const STUB_PARTITION_COUNT: i32 = 271;

/// Request operation that never receives a response.
pub const OP_NO_REPLY: &str = "no-reply";

struct StubMember {
    info: MemberInfo,
    running: bool,
    /// Bumped to kill every open connection of the member.
    kill: watch::Sender<u64>,
    connections: usize,
    /// Reads requests but never answers them.
    unresponsive: bool,
}

struct StubState {
    cluster_name: String,
    cluster_id: Uuid,
    partition_count: i32,
    members: Vec<StubMember>,
    members_version: i32,
    member_groups: Option<(Vec<HashSet<Uuid>>, i32)>,
    credentials: Option<Credentials>,
    failures: VecDeque<ErrorCode>,
    /// Push channels of authenticated connections.
    listeners: Vec<mpsc::UnboundedSender<ClientMessage>>,
    requests: u64,
}

impl StubState {
    fn member(&self, address: SocketAddr) -> Option<&StubMember> {
        self.members.iter().find(|m| m.info.address == address)
    }

    fn member_mut(&mut self, address: SocketAddr) -> Option<&mut StubMember> {
        self.members.iter_mut().find(|m| m.info.address == address)
    }

    fn members_view(&self) -> ServerEvent {
        ServerEvent::MembersView {
            version: self.members_version,
            members: self.members.iter().map(|m| m.info.clone()).collect(),
        }
    }

    fn partitions_view(&self) -> ServerEvent {
        let owners: Vec<&MemberInfo> = self
            .members
            .iter()
            .map(|m| &m.info)
            .filter(|m| !m.is_lite_member)
            .collect();
        let mut partitions: Vec<(Uuid, Vec<i32>)> = owners.iter().map(|m| (m.id, Vec::new())).collect();
        if !partitions.is_empty() {
            for pid in 0..self.partition_count {
                let idx = pid as usize % partitions.len();
                partitions[idx].1.push(pid);
            }
        }
        ServerEvent::PartitionsView {
            version: self.members_version,
            partitions,
        }
    }

    fn groups_view(&self, from: Uuid) -> Option<MemberGroups> {
        self.member_groups
            .as_ref()
            .map(|(groups, version)| MemberGroups::new(groups.clone(), *version, self.cluster_id, from))
    }

    fn push(&mut self, event: ServerEvent) {
        let message = ClientMessage::new(MessageBody::Event(event));
        self.listeners.retain(|tx| tx.send(message.clone()).is_ok());
    }
}

/// A simulated cluster of stub members.
#[derive(Clone)]
pub struct StubCluster {
    state: Arc<Mutex<StubState>>,
}

impl StubCluster {
    /// A cluster named `cluster_name` with members at the given addresses.
    pub fn new(cluster_name: impl Into<String>, addresses: &[SocketAddr]) -> Self {
        let members = addresses.iter().map(|addr| new_member(*addr)).collect();
        Self {
            state: Arc::new(Mutex::new(StubState {
                cluster_name: cluster_name.into(),
                cluster_id: Uuid::new_v4(),
                partition_count: STUB_PARTITION_COUNT,
                members,
                members_version: 1,
                member_groups: None,
                credentials: None,
                failures: VecDeque::new(),
                listeners: Vec::new(),
                requests: 0,
            })),
        }
    }

    /// A cluster with `count` members on loopback ports starting at `base_port`.
    pub fn local(cluster_name: impl Into<String>, base_port: u16, count: u16) -> Self {
        let addresses: Vec<SocketAddr> = (0..count)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], base_port + i)))
            .collect();
        Self::new(cluster_name, &addresses)
    }

    pub fn cluster_name(&self) -> String {
        self.state.lock().cluster_name.clone()
    }

    pub fn cluster_id(&self) -> Uuid {
        self.state.lock().cluster_id
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.state.lock().members.iter().map(|m| m.info.address).collect()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().members.iter().map(|m| m.info.clone()).collect()
    }

    pub fn member_at(&self, address: SocketAddr) -> Option<MemberInfo> {
        self.state.lock().member(address).map(|m| m.info.clone())
    }

    pub fn has_member(&self, address: SocketAddr) -> bool {
        self.state.lock().member(address).is_some()
    }

    pub fn is_running(&self, address: SocketAddr) -> bool {
        self.state.lock().member(address).map_or(false, |m| m.running)
    }

    /// Open connections served by the member at `address`.
    pub fn connection_count(&self, address: SocketAddr) -> usize {
        self.state.lock().member(address).map_or(0, |m| m.connections)
    }

    /// Number of `Request` messages answered so far.
    pub fn request_count(&self) -> u64 {
        self.state.lock().requests
    }

    pub fn set_partition_count(&self, count: i32) {
        self.state.lock().partition_count = count;
    }

    /// Only accept clients presenting `credentials`.
    pub fn require_credentials(&self, credentials: Credentials) {
        self.state.lock().credentials = Some(credentials);
    }

    /// Fail the next requests with the given error codes, in order.
    pub fn fail_next_requests(&self, codes: impl IntoIterator<Item = ErrorCode>) {
        self.state.lock().failures.extend(codes);
    }

    /// Simulate the cluster being replaced by a new one (new cluster id).
    pub fn reset_cluster_id(&self) -> Uuid {
        let mut state = self.state.lock();
        state.cluster_id = Uuid::new_v4();
        state.cluster_id
    }

    /// Publish a member-group view (bumping its version) to every client.
    pub fn set_member_groups(&self, groups: Vec<HashSet<Uuid>>) {
        let mut state = self.state.lock();
        let version = state.member_groups.as_ref().map_or(1, |(_, v)| v + 1);
        state.member_groups = Some((groups, version));
        let from = state.members.first().map_or(Uuid::nil(), |m| m.info.id);
        if let Some(view) = state.groups_view(from) {
            state.push(ServerEvent::MemberGroupsView(view));
        }
    }

    /// Stop a member: its connections are closed and new ones refused.
    pub fn stop_member(&self, address: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(member) = state.member_mut(address) {
            info!("stub: stopping member {}", member.info);
            member.running = false;
            member.kill.send_modify(|generation| *generation += 1);
        }
    }

    /// Keep the member's connections open but stop answering on them.
    pub fn set_unresponsive(&self, address: SocketAddr, unresponsive: bool) {
        if let Some(member) = self.state.lock().member_mut(address) {
            member.unresponsive = unresponsive;
        }
    }

    pub fn start_member(&self, address: SocketAddr) {
        if let Some(member) = self.state.lock().member_mut(address) {
            info!("stub: starting member {}", member.info);
            member.running = true;
        }
    }

    /// Stop every member.
    pub fn stop(&self) {
        for address in self.addresses() {
            self.stop_member(address);
        }
    }

    /// Add a member and publish the new views.
    pub fn add_member(&self, address: SocketAddr) -> MemberInfo {
        let mut state = self.state.lock();
        let member = new_member(address);
        let info = member.info.clone();
        state.members.push(member);
        state.members_version += 1;
        let members = state.members_view();
        let partitions = state.partitions_view();
        state.push(members);
        state.push(partitions);
        info
    }

    /// Stop and remove a member, then publish the new views.
    pub fn remove_member(&self, address: SocketAddr) {
        self.stop_member(address);
        let mut state = self.state.lock();
        state.members.retain(|m| m.info.address != address);
        state.members_version += 1;
        let members = state.members_view();
        let partitions = state.partitions_view();
        state.push(members);
        state.push(partitions);
    }

    /// Accept a new connection to the member at `address`.
    pub(crate) fn check_accept(&self, address: SocketAddr) -> ClientResult<()> {
        if self.is_running(address) {
            Ok(())
        } else {
            Err(ClientError::Network(format!("connection refused: {}", address)))
        }
    }

    /// Serve one inbound channel as the member at `member_address`.
    pub fn serve(&self, member_address: SocketAddr, channel: Channel) {
        let mut kill = {
            let mut state = self.state.lock();
            match state.member_mut(member_address) {
                Some(member) => {
                    member.connections += 1;
                    member.kill.subscribe()
                }
                None => return,
            }
        };

        let cluster = self.clone();
        tokio::spawn(async move {
            let Channel {
                mut writer,
                mut reader,
                ..
            } = channel;
            let (push_tx, mut push_rx) = mpsc::unbounded_channel();
            let mut push_tx = Some(push_tx);

            loop {
                tokio::select! {
                    read = reader.read() => {
                        let message = match read {
                            Ok(Some(message)) => message,
                            _ => break,
                        };
                        let replies = cluster.handle(member_address, message, &mut push_tx);
                        let mut failed = false;
                        for reply in replies {
                            if writer.write(&reply).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(event) = push_rx.recv() => {
                        if writer.write(&event).await.is_err() {
                            break;
                        }
                    }
                    _ = kill.changed() => break,
                }
            }

            writer.close().await;
            if let Some(member) = cluster.state.lock().member_mut(member_address) {
                member.connections -= 1;
            }
            debug!("stub: connection to {} closed", member_address);
        });
    }

    fn handle(
        &self,
        member_address: SocketAddr,
        message: ClientMessage,
        push_tx: &mut Option<mpsc::UnboundedSender<ClientMessage>>,
    ) -> Vec<ClientMessage> {
        let mut state = self.state.lock();
        let member = match state.member(member_address) {
            Some(m) if !m.unresponsive => m.info.clone(),
            _ => return Vec::new(),
        };
        let correlation_id = message.correlation_id;

        match message.body {
            MessageBody::Authentication(request) => {
                let status = authenticate(&state, &request);
                let response = AuthenticationResponse {
                    status,
                    member_id: member.id,
                    member_address: member.address,
                    cluster_id: state.cluster_id,
                    partition_count: state.partition_count,
                    server_version: STUB_VERSION,
                    member_groups: state.groups_view(member.id),
                };
                let mut replies = vec![ClientMessage::reply(
                    correlation_id,
                    MessageBody::AuthenticationResponse(response),
                )];
                if status == AuthenticationStatus::Authenticated {
                    if let Some(tx) = push_tx.take() {
                        state.listeners.push(tx);
                    }
                    replies.push(ClientMessage::new(MessageBody::Event(state.members_view())));
                    replies.push(ClientMessage::new(MessageBody::Event(state.partitions_view())));
                }
                replies
            }
            MessageBody::Ping => vec![ClientMessage::reply(correlation_id, MessageBody::Pong)],
            MessageBody::Request { operation, payload } => {
                if operation == OP_NO_REPLY {
                    return Vec::new();
                }
                state.requests += 1;
                let body = match state.failures.pop_front() {
                    Some(code) => MessageBody::Error {
                        code,
                        message: format!("{} failed on {}", operation, member.address),
                    },
                    None => MessageBody::Response { payload },
                };
                vec![ClientMessage::reply(correlation_id, body)]
            }
            _ => vec![ClientMessage::reply(
                correlation_id,
                MessageBody::Error {
                    code: ErrorCode::IllegalArgument,
                    message: "unexpected message".into(),
                },
            )],
        }
    }
}

fn new_member(address: SocketAddr) -> StubMember {
    let (kill, _) = watch::channel(0);
    StubMember {
        info: MemberInfo::new(Uuid::new_v4(), address).with_version(STUB_VERSION),
        running: true,
        kill,
        connections: 0,
        unresponsive: false,
    }
}

fn authenticate(state: &StubState, request: &AuthenticationRequest) -> AuthenticationStatus {
    if request.serialization_version != SERIALIZATION_VERSION {
        return AuthenticationStatus::SerializationVersionMismatch;
    }
    if request.cluster_name != state.cluster_name {
        return AuthenticationStatus::NotAllowedInCluster;
    }
    match &state.credentials {
        Some(required) if required != &request.credentials => AuthenticationStatus::CredentialsFailed,
        _ => AuthenticationStatus::Authenticated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(cluster_name: &str, credentials: Credentials) -> ClientMessage {
        let mut message = ClientMessage::new(MessageBody::Authentication(AuthenticationRequest {
            cluster_name: cluster_name.into(),
            credentials,
            client_id: Uuid::new_v4(),
            client_name: "test".into(),
            serialization_version: SERIALIZATION_VERSION,
        }));
        message.correlation_id = 1;
        message
    }

    fn status(replies: &[ClientMessage]) -> AuthenticationStatus {
        match &replies[0].body {
            MessageBody::AuthenticationResponse(response) => response.status,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_authentication_pushes_views() {
        let cluster = StubCluster::local("dev", 5701, 2);
        let address = cluster.addresses()[0];
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut push_tx = Some(tx);

        let replies = cluster.handle(address, auth("dev", Credentials::None), &mut push_tx);
        assert_eq!(status(&replies), AuthenticationStatus::Authenticated);
        assert_eq!(replies[0].correlation_id, 1);
        assert!(push_tx.is_none());
        assert_eq!(replies.len(), 3);
        assert!(matches!(
            &replies[1].body,
            MessageBody::Event(ServerEvent::MembersView { version: 1, members }) if members.len() == 2
        ));
    }

    #[test]
    fn test_authentication_rejections() {
        let cluster = StubCluster::local("dev", 5701, 1);
        cluster.require_credentials(Credentials::UsernamePassword {
            username: "admin".into(),
            password: "secret".into(),
        });
        let address = cluster.addresses()[0];
        let mut push_tx = None;

        let replies = cluster.handle(address, auth("prod", Credentials::None), &mut push_tx);
        assert_eq!(status(&replies), AuthenticationStatus::NotAllowedInCluster);
        assert_eq!(replies.len(), 1);

        let replies = cluster.handle(address, auth("dev", Credentials::None), &mut push_tx);
        assert_eq!(status(&replies), AuthenticationStatus::CredentialsFailed);
    }

    #[test]
    fn test_partitions_spread_over_data_members() {
        let cluster = StubCluster::local("dev", 5701, 3);
        cluster.set_partition_count(10);
        let state = cluster.state.lock();
        let ServerEvent::PartitionsView { partitions, .. } = state.partitions_view() else {
            panic!("expected a partitions view");
        };
        let sizes: Vec<usize> = partitions.iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(partitions[1].1, vec![1, 4, 7]);
    }

    #[test]
    fn test_scripted_failures_then_echo() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let address = cluster.addresses()[0];
        cluster.fail_next_requests([ErrorCode::TargetNotMember]);
        let mut push_tx = None;

        let first = cluster.handle(address, ClientMessage::request("get", b"k".to_vec()), &mut push_tx);
        assert!(matches!(
            first[0].body,
            MessageBody::Error { code: ErrorCode::TargetNotMember, .. }
        ));
        let second = cluster.handle(address, ClientMessage::request("get", b"k".to_vec()), &mut push_tx);
        assert_eq!(second[0].body, MessageBody::Response { payload: b"k".to_vec() });
        assert_eq!(cluster.request_count(), 2);

        assert!(cluster
            .handle(address, ClientMessage::request(OP_NO_REPLY, Vec::new()), &mut push_tx)
            .is_empty());
    }

    #[test]
    fn test_membership_changes_bump_version() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let added = SocketAddr::from(([127, 0, 0, 1], 5702));
        let info = cluster.add_member(added);
        assert_eq!(info.address, added);
        assert!(cluster.is_running(added));

        cluster.remove_member(added);
        assert!(!cluster.has_member(added));
        assert_eq!(cluster.state.lock().members_version, 3);
        assert!(cluster.check_accept(added).is_err());
    }
}
