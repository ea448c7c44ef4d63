//! Member transport abstraction, separating connection logic from the wire.
//!
//! Two implementations:
//! - [`TcpTransport`](crate::tcp_transport::TcpTransport): kernel TCP with
//!   length-prefixed bincode frames
//! - [`MemoryTransport`](crate::memory_transport::MemoryTransport): in-process
//!   channels to a [`StubCluster`](crate::stub::StubCluster), for tests and
//!   development
//!
//! [`MemberConnection`](crate::member_connection::MemberConnection) only sees
//! decoded [`ClientMessage`]s; the byte layout stays behind this trait.

use std::net::SocketAddr;

use async_trait::async_trait;

use datagrid_proto::error::ClientResult;
use datagrid_proto::message::ClientMessage;

/// Opens channels to members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human-readable name for logging ("tcp" or "memory").
    fn name(&self) -> &str;

    /// Open a channel to the member listening on `address`.
    async fn open(&self, address: SocketAddr) -> ClientResult<Channel>;
}

/// Write half of a channel.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write(&mut self, message: &ClientMessage) -> ClientResult<()>;

    /// Close the write side; the peer observes end-of-stream.
    async fn close(&mut self);
}

/// Read half of a channel.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next message, or `None` once the peer closed the channel.
    async fn read(&mut self) -> ClientResult<Option<ClientMessage>>;
}

/// Both halves of an open channel.
pub struct Channel {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
    /// Local address, when the transport has one.
    pub local_address: Option<SocketAddr>,
}

impl Channel {
    pub fn new(writer: Box<dyn FrameWriter>, reader: Box<dyn FrameReader>) -> Self {
        Self {
            writer,
            reader,
            local_address: None,
        }
    }
}
