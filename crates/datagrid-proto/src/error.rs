/// Datagrid client error types.
///
/// Server-side failures travel as an [`ErrorCode`] inside an error response
/// and surface as [`ClientError::Server`]; everything else is raised locally
/// by the connection layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::ClientState;

/// Error codes carried by server error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Undefined,
    IllegalArgument,
    Authentication,
    /// The member is not (or no longer) the owner of the partition.
    WrongTarget,
    /// The targeted member is not part of the cluster.
    TargetNotMember,
    /// The calling member is not part of the cluster.
    CallerNotMember,
    /// The partition is being migrated.
    PartitionMigrating,
    /// The member is starting up or shutting down.
    InstanceNotActive,
    /// Generic retryable condition.
    Retryable,
    OperationTimeout,
}

impl ErrorCode {
    /// Convert from a raw protocol error code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::IllegalArgument,
            2 => Self::Authentication,
            3 => Self::WrongTarget,
            4 => Self::TargetNotMember,
            5 => Self::CallerNotMember,
            6 => Self::PartitionMigrating,
            7 => Self::InstanceNotActive,
            8 => Self::Retryable,
            9 => Self::OperationTimeout,
            _ => Self::Undefined,
        }
    }

    /// Convert to a raw protocol error code.
    pub fn to_code(self) -> i32 {
        match self {
            Self::Undefined => 0,
            Self::IllegalArgument => 1,
            Self::Authentication => 2,
            Self::WrongTarget => 3,
            Self::TargetNotMember => 4,
            Self::CallerNotMember => 5,
            Self::PartitionMigrating => 6,
            Self::InstanceNotActive => 7,
            Self::Retryable => 8,
            Self::OperationTimeout => 9,
        }
    }

    /// Whether the target is only temporarily unable to serve the request.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::WrongTarget
                | Self::TargetNotMember
                | Self::CallerNotMember
                | Self::PartitionMigrating
                | Self::InstanceNotActive
                | Self::Retryable
        )
    }
}

/// Unified error type for all client connection-layer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("connection attempt timed out")]
    ConnectionTimeout,
    #[error("invalid credentials")]
    CredentialsFailed,
    #[error("client is not allowed in cluster {0}")]
    NotAllowedInCluster(String),
    #[error("serialization version mismatch")]
    SerializationVersionMismatch,
    #[error("target {address} disconnected")]
    TargetDisconnected { address: String },
    #[error("member {0} is not connected")]
    TargetUnreachable(Uuid),
    #[error("client is not connected to the cluster")]
    NotConnected,
    #[error("client is not active")]
    ClientNotActive,
    #[error("heartbeat timeout on connection to {0}")]
    HeartbeatTimeout(String),
    #[error("invocation timed out")]
    InvocationTimeout,
    #[error("operation timed out after {elapsed_ms} ms of retries")]
    OperationTimeout { elapsed_ms: u64 },
    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("unable to connect to any cluster")]
    ClusterUnreachable,
    #[error("topology conflict: {0}")]
    TopologyConflict(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: ClientState, to: ClientState },
    #[error("connection queue is already being enumerated")]
    QueueAlreadyEnumerated,
    #[error("previous connection request has not been completed")]
    RequestNotCompleted,
    #[error("no members available")]
    NoMembers,
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    /// Transient failures that a retry on some connection may cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Network(_)
            | Self::ConnectionTimeout
            | Self::NotConnected
            | Self::TargetUnreachable(_)
            | Self::HeartbeatTimeout(_) => true,
            Self::Server { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Failures that must stop connection attempts altogether.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TopologyConflict(_)
                | Self::InvalidConfiguration(_)
                | Self::SerializationVersionMismatch
        )
    }

    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}
