//! One authenticated session with one member.
//!
//! A connection goes `Disconnected -> Connecting -> Active -> Closed`.
//! [`MemberConnection::connect`] opens the transport and runs the
//! authentication exchange; the owner then decides whether to keep the
//! connection and calls [`MemberConnection::activate`], which starts
//! forwarding server events. Responses are matched to requests by
//! correlation id from a background reader task.
//!
//! The connection reports back to its owner only through the
//! [`ConnectionEvent`] channel it was created with. Closing is idempotent:
//! the first close fails every pending request with
//! [`ClientError::TargetDisconnected`] and emits exactly one
//! [`ConnectionEvent::Closed`] (for connections that became active).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::groups::MemberGroups;
use datagrid_proto::member::MemberVersion;
use datagrid_proto::message::{
    AuthenticationRequest, AuthenticationStatus, ClientMessage, MessageBody, ServerEvent,
};

use crate::clock::SharedClock;
use crate::invocation::Invocation;
use crate::transport::{FrameReader, FrameWriter, Transport};

/// Notifications sent by connections to their owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A server event arrived on an active connection.
    Event {
        connection_id: Uuid,
        member_id: Uuid,
        event: ServerEvent,
    },
    /// An active connection closed.
    Closed {
        connection_id: Uuid,
        member_id: Uuid,
        address: SocketAddr,
        reason: ClientError,
    },
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// What a member told us while authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    pub member_id: Uuid,
    pub member_address: SocketAddr,
    pub cluster_id: Uuid,
    pub partition_count: i32,
    pub server_version: MemberVersion,
    pub member_groups: Option<MemberGroups>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Closed,
}

type ResponseSender = oneshot::Sender<ClientResult<ClientMessage>>;

/// Receives the response of one sent request.
pub struct PendingResponse {
    rx: oneshot::Receiver<ClientResult<ClientMessage>>,
}

impl PendingResponse {
    pub async fn wait(self) -> ClientResult<ClientMessage> {
        // The sender only disappears when the connection is torn down.
        self.rx.await.unwrap_or(Err(ClientError::NotConnected))
    }
}

struct Timestamps {
    last_read: Instant,
    last_write: Instant,
}

/// A transport session with one member.
pub struct MemberConnection {
    id: Uuid,
    address: SocketAddr,
    state: Mutex<ConnectionState>,
    member_id: Mutex<Option<Uuid>>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWriter>>>,
    pending: DashMap<i64, ResponseSender>,
    /// Events received before activation.
    held_events: Mutex<Vec<ServerEvent>>,
    events: ConnectionEventSender,
    closed: AtomicBool,
    /// Stops the reader task.
    stop: Notify,
    timestamps: Mutex<Timestamps>,
    clock: SharedClock,
}

impl MemberConnection {
    pub fn new(address: SocketAddr, events: ConnectionEventSender, clock: SharedClock) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Self {
            id: Uuid::new_v4(),
            address,
            state: Mutex::new(ConnectionState::Disconnected),
            member_id: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            pending: DashMap::new(),
            held_events: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            timestamps: Mutex::new(Timestamps {
                last_read: now,
                last_write: now,
            }),
            clock,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Member id confirmed by the server, once authenticated.
    pub fn member_id(&self) -> Option<Uuid> {
        *self.member_id.lock()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_read(&self) -> Instant {
        self.timestamps.lock().last_read
    }

    pub fn last_write(&self) -> Instant {
        self.timestamps.lock().last_write
    }

    /// Requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open the transport and authenticate, within `timeout`.
    ///
    /// On failure the connection is closed and cannot be reused.
    pub async fn connect(
        self: &Arc<Self>,
        transport: &dyn Transport,
        request: AuthenticationRequest,
        correlation_id: i64,
        timeout: Duration,
    ) -> ClientResult<AuthenticationResult> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::NotConnected);
            }
            *state = ConnectionState::Connecting;
        }
        debug!("connection {}: connecting to {} over {}", self.id, self.address, transport.name());

        let result = tokio::select! {
            result = self.authenticate(transport, request, correlation_id) => result,
            _ = self.clock.sleep(timeout) => Err(ClientError::ConnectionTimeout),
        };
        if let Err(e) = &result {
            debug!("connection {}: failed to connect to {}: {}", self.id, self.address, e);
            self.close(e.clone());
        }
        result
    }

    async fn authenticate(
        self: &Arc<Self>,
        transport: &dyn Transport,
        request: AuthenticationRequest,
        correlation_id: i64,
    ) -> ClientResult<AuthenticationResult> {
        let channel = transport.open(self.address).await?;
        *self.writer.lock().await = Some(channel.writer);
        self.spawn_reader(channel.reader);

        let mut message = ClientMessage::new(MessageBody::Authentication(request));
        message.correlation_id = correlation_id;
        let reply = self.send_message(&message).await?.wait().await?;

        let response = match reply.body {
            MessageBody::AuthenticationResponse(response) => response,
            other => {
                return Err(ClientError::Codec(format!(
                    "unexpected authentication reply: {:?}",
                    other
                )))
            }
        };

        match response.status {
            AuthenticationStatus::Authenticated => {}
            AuthenticationStatus::CredentialsFailed => return Err(ClientError::CredentialsFailed),
            AuthenticationStatus::NotAllowedInCluster => {
                return Err(ClientError::NotAllowedInCluster(format!(
                    "member {} rejected the cluster name",
                    response.member_address
                )))
            }
            AuthenticationStatus::SerializationVersionMismatch => {
                return Err(ClientError::SerializationVersionMismatch)
            }
        }

        *self.member_id.lock() = Some(response.member_id);
        Ok(AuthenticationResult {
            member_id: response.member_id,
            member_address: response.member_address,
            cluster_id: response.cluster_id,
            partition_count: response.partition_count,
            server_version: response.server_version,
            member_groups: response.member_groups,
        })
    }

    /// Mark the authenticated connection as kept and start forwarding the
    /// server events received so far and from now on.
    pub fn activate(&self) -> ClientResult<()> {
        let member_id = self.member_id().ok_or(ClientError::NotConnected)?;
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting || self.is_closed() {
            return Err(self.disconnected());
        }
        *state = ConnectionState::Active;
        // Flush under the state lock so held events stay ahead of new ones.
        for event in self.held_events.lock().drain(..) {
            let _ = self.events.send(ConnectionEvent::Event {
                connection_id: self.id,
                member_id,
                event,
            });
        }
        drop(state);
        info!("connection {}: active to member {} at {}", self.id, member_id, self.address);
        Ok(())
    }

    /// Send an invocation's current message.
    pub async fn send(&self, invocation: &Invocation) -> ClientResult<PendingResponse> {
        self.send_message(invocation.message()).await
    }

    /// Register `message` by correlation id and write it.
    pub async fn send_message(&self, message: &ClientMessage) -> ClientResult<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let correlation_id = message.correlation_id;
        self.pending.insert(correlation_id, tx);
        if self.is_closed() {
            self.pending.remove(&correlation_id);
            return Err(self.disconnected());
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write(message).await,
                None => Err(ClientError::NotConnected),
            }
        };
        if let Err(e) = written {
            self.pending.remove(&correlation_id);
            self.close(e.clone());
            return Err(e);
        }

        self.timestamps.lock().last_write = self.clock.now();
        Ok(PendingResponse { rx })
    }

    /// Forget a request whose caller gave up waiting.
    pub fn abandon(&self, correlation_id: i64) {
        self.pending.remove(&correlation_id);
    }

    /// Close the connection. Only the first call has an effect.
    pub fn close(&self, reason: ClientError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_active = {
            let mut state = self.state.lock();
            let was_active = *state == ConnectionState::Active;
            *state = ConnectionState::Closed;
            was_active
        };
        debug!("connection {}: closing ({})", self.id, reason);

        let keys: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(self.disconnected()));
            }
        }
        self.held_events.lock().clear();
        self.stop.notify_one();

        if was_active {
            if let Some(member_id) = self.member_id() {
                let _ = self.events.send(ConnectionEvent::Closed {
                    connection_id: self.id,
                    member_id,
                    address: self.address,
                    reason,
                });
            }
        }
    }

    fn disconnected(&self) -> ClientError {
        ClientError::TargetDisconnected {
            address: self.address.to_string(),
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: Box<dyn FrameReader>) {
        let conn = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    read = reader.read() => match read {
                        Ok(Some(message)) => conn.dispatch(message),
                        Ok(None) => break ClientError::TargetDisconnected {
                            address: conn.address.to_string(),
                        },
                        Err(e) => break e,
                    },
                    _ = conn.stop.notified() => break ClientError::NotConnected,
                }
            };
            conn.close(reason);
            if let Some(mut writer) = conn.writer.lock().await.take() {
                writer.close().await;
            }
        });
    }

    fn dispatch(&self, message: ClientMessage) {
        self.timestamps.lock().last_read = self.clock.now();

        if let MessageBody::Event(event) = message.body {
            let state = self.state.lock();
            match *state {
                ConnectionState::Active => {
                    if let Some(member_id) = self.member_id() {
                        let _ = self.events.send(ConnectionEvent::Event {
                            connection_id: self.id,
                            member_id,
                            event,
                        });
                    }
                }
                ConnectionState::Connecting => self.held_events.lock().push(event),
                _ => {}
            }
            return;
        }

        let Some((_, tx)) = self.pending.remove(&message.correlation_id) else {
            if message.body != MessageBody::Pong {
                warn!(
                    "connection {}: no pending request for correlation id {}",
                    self.id, message.correlation_id
                );
            }
            return;
        };
        let result = match message.body {
            MessageBody::Error { code, message } => Err(ClientError::Server { code, message }),
            _ => Ok(message),
        };
        let _ = tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tokio_clock;
    use crate::memory_transport::MemoryTransport;
    use crate::stub::{StubCluster, OP_NO_REPLY};
    use datagrid_proto::defaults::SERIALIZATION_VERSION;
    use datagrid_proto::error::ErrorCode;
    use datagrid_proto::message::Credentials;

    fn auth(cluster_name: &str) -> AuthenticationRequest {
        AuthenticationRequest {
            cluster_name: cluster_name.into(),
            credentials: Credentials::None,
            client_id: Uuid::new_v4(),
            client_name: "test".into(),
            serialization_version: SERIALIZATION_VERSION,
        }
    }

    async fn connected(
        cluster: &StubCluster,
    ) -> (Arc<MemberConnection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let transport = MemoryTransport::single(cluster.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = MemberConnection::new(cluster.addresses()[0], tx, tokio_clock());
        conn.connect(&transport, auth("dev"), 1, Duration::from_secs(5))
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_authenticates_and_forwards_events_once_active() {
        let cluster = StubCluster::local("dev", 5701, 2);
        let (conn, mut rx) = connected(&cluster).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.member_id(), Some(cluster.members()[0].id));

        conn.activate().unwrap();
        assert!(conn.is_active());
        match rx.recv().await.unwrap() {
            ConnectionEvent::Event {
                event: ServerEvent::MembersView { members, .. },
                member_id,
                ..
            } => {
                assert_eq!(members.len(), 2);
                assert_eq!(member_id, cluster.members()[0].id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_response_and_server_error() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let (conn, _rx) = connected(&cluster).await;
        conn.activate().unwrap();

        let mut request = ClientMessage::request("echo", b"hello".to_vec());
        request.correlation_id = 7;
        let reply = conn.send_message(&request).await.unwrap().wait().await.unwrap();
        assert_eq!(reply.correlation_id, 7);
        assert_eq!(
            reply.body,
            MessageBody::Response {
                payload: b"hello".to_vec()
            }
        );

        cluster.fail_next_requests([ErrorCode::PartitionMigrating]);
        request.correlation_id = 8;
        let err = conn.send_message(&request).await.unwrap().wait().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Server {
                code: ErrorCode::PartitionMigrating,
                ..
            }
        ));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_cluster_name_is_rejected() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let transport = MemoryTransport::single(cluster.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = MemberConnection::new(cluster.addresses()[0], tx, tokio_clock());
        let err = conn
            .connect(&transport, auth("prod"), 1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotAllowedInCluster(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_bad_credentials_are_rejected() {
        let cluster = StubCluster::local("dev", 5701, 1);
        cluster.require_credentials(Credentials::Token(b"secret".to_vec()));
        let transport = MemoryTransport::single(cluster.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = MemberConnection::new(cluster.addresses()[0], tx, tokio_clock());
        let err = conn
            .connect(&transport, auth("dev"), 1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::CredentialsFailed);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_fires_once() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let (conn, mut rx) = connected(&cluster).await;
        conn.activate().unwrap();

        let mut request = ClientMessage::request(OP_NO_REPLY, vec![]);
        request.correlation_id = 2;
        let first = conn.send_message(&request).await.unwrap();
        request.correlation_id = 3;
        let second = conn.send_message(&request).await.unwrap();
        assert_eq!(conn.pending_count(), 2);

        cluster.stop_member(cluster.addresses()[0]);
        assert!(matches!(
            first.wait().await,
            Err(ClientError::TargetDisconnected { .. })
        ));
        assert!(matches!(
            second.wait().await,
            Err(ClientError::TargetDisconnected { .. })
        ));

        conn.close(ClientError::NotConnected);
        let mut closed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ConnectionEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(conn.send_message(&request).await.is_err());
    }

    struct UnresponsiveTransport;

    #[async_trait::async_trait]
    impl Transport for UnresponsiveTransport {
        fn name(&self) -> &str {
            "unresponsive"
        }

        async fn open(&self, _address: SocketAddr) -> ClientResult<crate::transport::Channel> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = MemberConnection::new("127.0.0.1:5701".parse().unwrap(), tx, tokio_clock());
        let start = Instant::now();
        let err = conn
            .connect(&UnresponsiveTransport, auth("dev"), 1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::ConnectionTimeout);
        assert_eq!(Instant::now() - start, Duration::from_secs(5));
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
