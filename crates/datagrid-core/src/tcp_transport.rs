//! TCP member transport, the default implementation over kernel networking.
//!
//! Wire format: `u32 length prefix (big-endian) + bincode(ClientMessage)`, in
//! both directions.
//!
//! The listener side is only used to serve stub members (see `gridctl serve`).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error};

use datagrid_proto::defaults::DEFAULT_MAX_FRAME_SIZE;
use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::ClientMessage;

use crate::stub::StubCluster;
use crate::transport::{Channel, FrameReader, FrameWriter, Transport};

/// TCP-based member transport.
pub struct TcpTransport {
    max_frame_size: usize,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn open(&self, address: SocketAddr) -> ClientResult<Channel> {
        debug!("tcp: connecting to {}", address);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ClientError::Network(format!("connect to {}: {}", address, e)))?;
        stream.set_nodelay(true).ok();
        Ok(split_stream(stream, self.max_frame_size))
    }
}

fn split_stream(stream: TcpStream, max_frame_size: usize) -> Channel {
    let local_address = stream.local_addr().ok();
    let (read_half, write_half) = stream.into_split();
    Channel {
        writer: Box::new(TcpFrameWriter { stream: write_half }),
        reader: Box::new(TcpFrameReader {
            stream: read_half,
            max_frame_size,
        }),
        local_address,
    }
}

// ─── Frame halves ─────────────────────────────────────────────────────────────

struct TcpFrameWriter {
    stream: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write(&mut self, message: &ClientMessage) -> ClientResult<()> {
        let data = bincode::serialize(message).map_err(|e| ClientError::Codec(e.to_string()))?;
        self.stream
            .write_u32(data.len() as u32)
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        self.stream
            .write_all(&data)
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.stream.shutdown().await.ok();
    }
}

struct TcpFrameReader {
    stream: OwnedReadHalf,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read(&mut self) -> ClientResult<Option<ClientMessage>> {
        let frame_len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ClientError::Network(e.to_string())),
        };

        if frame_len == 0 || frame_len > self.max_frame_size {
            return Err(ClientError::FrameTooLarge(frame_len));
        }

        let mut buf = vec![0u8; frame_len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let message = bincode::deserialize(&buf).map_err(|e| ClientError::Codec(e.to_string()))?;
        Ok(Some(message))
    }
}

// ─── Stub member listener ─────────────────────────────────────────────────────

/// Handle to a TCP listener serving one stub member.
pub struct TcpStubListener {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl TcpStubListener {
    /// Bind `bind_addr` and serve the stub member registered at
    /// `member_address` in `cluster` to every inbound connection.
    pub async fn serve(
        cluster: StubCluster,
        bind_addr: SocketAddr,
        member_address: SocketAddr,
    ) -> ClientResult<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            error!("tcp: stub listener failed to bind {}: {}", bind_addr, e);
            ClientError::Network(e.to_string())
        })?;
        let local_addr = listener.local_addr()?;
        debug!("tcp: stub member {} listening on {}", member_address, local_addr);

        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!("tcp: stub member {} accepted {}", member_address, peer);
                                stream.set_nodelay(true).ok();
                                let channel = split_stream(stream, DEFAULT_MAX_FRAME_SIZE);
                                cluster.serve(member_address, channel);
                            }
                            Err(e) => error!("tcp: accept error: {}", e),
                        }
                    }
                    _ = stop.notified() => {
                        debug!("tcp: stub listener {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for TcpStubListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_proto::message::MessageBody;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = split_stream(stream, DEFAULT_MAX_FRAME_SIZE);
            let msg = channel.reader.read().await.unwrap().unwrap();
            channel
                .writer
                .write(&ClientMessage::reply(msg.correlation_id, MessageBody::Pong))
                .await
                .unwrap();
            channel.writer.close().await;
        });

        let transport = TcpTransport::new();
        let mut channel = transport.open(addr).await.unwrap();
        let mut ping = ClientMessage::new(MessageBody::Ping);
        ping.correlation_id = 11;
        channel.writer.write(&ping).await.unwrap();

        let reply = channel.reader.read().await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, 11);
        assert_eq!(reply.body, MessageBody::Pong);

        server.await.unwrap();
        assert!(channel.reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_u32(1024).await.unwrap();
            stream.write_all(&[0u8; 16]).await.unwrap();
        });

        let transport = TcpTransport::with_max_frame_size(512);
        let mut channel = transport.open(addr).await.unwrap();
        assert_eq!(
            channel.reader.read().await.unwrap_err(),
            ClientError::FrameTooLarge(1024)
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let transport = TcpTransport::new();
        assert!(matches!(
            transport.open(addr).await,
            Err(ClientError::Network(_))
        ));
    }
}
