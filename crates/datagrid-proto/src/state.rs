/// Client lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a client.
///
/// ```text
/// Starting -> Started -> Connecting -> Connected -> Disconnected
/// Connecting -> ClusterChanged -> Connected
/// Connecting -> Disconnected
/// Disconnected -> Connecting | Switching
/// Switching -> Switched | Disconnected
/// Switched -> Connecting
/// any -> ShuttingDown -> ShutDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    Starting,
    Started,
    Connecting,
    Connected,
    Disconnected,
    Switching,
    Switched,
    /// Transient state entered when the client connects to a cluster whose
    /// identity differs from the last connected one.
    ClusterChanged,
    ShuttingDown,
    ShutDown,
}

impl ClientState {
    /// Whether `self -> next` is a legal edge of the lifecycle.
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;

        match (self, next) {
            (ShutDown, _) => false,
            (ShuttingDown, ShutDown) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Starting, Started) => true,
            (Started, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, ClusterChanged) => true,
            (Connecting, Disconnected) => true,
            (ClusterChanged, Connected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Disconnected, Switching) => true,
            (Switching, Switched) => true,
            (Switching, Disconnected) => true,
            (Switched, Connecting) => true,
            _ => false,
        }
    }

    /// Whether the client still accepts work (not shutting down or shut down).
    pub fn is_active(self) -> bool {
        !matches!(self, ClientState::ShuttingDown | ClientState::ShutDown)
    }

    pub fn is_terminal(self) -> bool {
        self == ClientState::ShutDown
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
