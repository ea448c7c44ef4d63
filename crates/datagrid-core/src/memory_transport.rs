//! In-process transport to stub clusters.
//!
//! Each opened channel is a pair of unbounded mpsc queues; the member side is
//! handed to the [`StubCluster`] owning the address. Closing either writer
//! ends the peer's reader, which is how a stopped member looks to the client.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::ClientMessage;

use crate::stub::StubCluster;
use crate::transport::{Channel, FrameReader, FrameWriter, Transport};

/// Transport connecting to stub members inside the process.
pub struct MemoryTransport {
    clusters: Vec<StubCluster>,
}

impl MemoryTransport {
    pub fn new(clusters: Vec<StubCluster>) -> Self {
        Self { clusters }
    }

    pub fn single(cluster: StubCluster) -> Self {
        Self::new(vec![cluster])
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self, address: SocketAddr) -> ClientResult<Channel> {
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.has_member(address))
            .ok_or_else(|| ClientError::Network(format!("no route to {}", address)))?;
        cluster.check_accept(address)?;

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        cluster.serve(address, pair(server_tx, server_rx));
        debug!("memory: opened channel to {}", address);
        Ok(pair(client_tx, client_rx))
    }
}

fn pair(
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ClientMessage>,
) -> Channel {
    Channel::new(
        Box::new(MemoryWriter { tx: Some(tx) }),
        Box::new(MemoryReader { rx }),
    )
}

struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<ClientMessage>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write(&mut self, message: &ClientMessage) -> ClientResult<()> {
        let tx = self.tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message.clone())
            .map_err(|_| ClientError::Network("channel closed by peer".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<ClientMessage>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read(&mut self) -> ClientResult<Option<ClientMessage>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_proto::message::MessageBody;

    #[tokio::test]
    async fn test_ping_through_stub() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let transport = MemoryTransport::single(cluster.clone());
        let addr = cluster.addresses()[0];

        let mut channel = transport.open(addr).await.unwrap();
        channel
            .writer
            .write(&ClientMessage::reply(3, MessageBody::Ping))
            .await
            .unwrap();
        let reply = channel.reader.read().await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, 3);
        assert_eq!(reply.body, MessageBody::Pong);
    }

    #[tokio::test]
    async fn test_stopped_member_refuses_and_closes() {
        let cluster = StubCluster::local("dev", 5701, 1);
        let transport = MemoryTransport::single(cluster.clone());
        let addr = cluster.addresses()[0];

        let mut channel = transport.open(addr).await.unwrap();
        cluster.stop_member(addr);
        assert!(channel.reader.read().await.unwrap().is_none());
        assert!(matches!(transport.open(addr).await, Err(ClientError::Network(_))));

        cluster.start_member(addr);
        assert!(transport.open(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let transport = MemoryTransport::single(StubCluster::local("dev", 5701, 1));
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(matches!(transport.open(addr).await, Err(ClientError::Network(_))));
    }
}
