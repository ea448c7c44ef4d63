/// Decoded client messages.
///
/// The byte layout of these messages belongs to the codec; the connection
/// layer only relies on the correlation id and the body variant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::groups::MemberGroups;
use crate::member::{MemberInfo, MemberVersion};

/// Sentinel partition id for messages not bound to a partition.
pub const NO_PARTITION: i32 = -1;

/// Credentials presented during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Credentials {
    #[default]
    None,
    UsernamePassword {
        username: String,
        password: String,
    },
    Token(Vec<u8>),
}

/// Authentication request sent as the first message on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    pub cluster_name: String,
    pub credentials: Credentials,
    pub client_id: Uuid,
    pub client_name: String,
    pub serialization_version: u8,
}

/// Outcome of the authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationStatus {
    Authenticated,
    CredentialsFailed,
    SerializationVersionMismatch,
    NotAllowedInCluster,
}

/// Authentication response returned by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    pub status: AuthenticationStatus,
    pub member_id: Uuid,
    pub member_address: std::net::SocketAddr,
    pub cluster_id: Uuid,
    pub partition_count: i32,
    pub server_version: MemberVersion,
    /// Member-group proposal made at authentication time, if the member
    /// supports multi-member routing.
    pub member_groups: Option<MemberGroups>,
}

/// Server events pushed to the client, already decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Full member list with its version.
    MembersView { version: i32, members: Vec<MemberInfo> },
    /// Partition owners with the view version.
    PartitionsView {
        version: i32,
        partitions: Vec<(Uuid, Vec<i32>)>,
    },
    /// Cluster codebase version changed.
    ClusterVersion(MemberVersion),
    /// Member-group view for multi-member routing.
    MemberGroupsView(MemberGroups),
}

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Authentication(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    Ping,
    Pong,
    /// Opaque request for a distributed-object operation.
    Request { operation: String, payload: Vec<u8> },
    Response { payload: Vec<u8> },
    Error { code: ErrorCode, message: String },
    Event(ServerEvent),
}

/// A decoded message exchanged with a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub correlation_id: i64,
    pub partition_id: i32,
    pub body: MessageBody,
}

impl ClientMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            correlation_id: 0,
            partition_id: NO_PARTITION,
            body,
        }
    }

    pub fn request(operation: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(MessageBody::Request {
            operation: operation.into(),
            payload,
        })
    }

    pub fn with_partition(mut self, partition_id: i32) -> Self {
        self.partition_id = partition_id;
        self
    }

    /// A message answering `correlation_id`.
    pub fn reply(correlation_id: i64, body: MessageBody) -> Self {
        Self {
            correlation_id,
            partition_id: NO_PARTITION,
            body,
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self.body, MessageBody::Event(_))
    }
}
