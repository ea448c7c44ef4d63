//! Connection liveness checks.
//!
//! Every period, connections that have not written for a full period get a
//! ping, and connections that have not read anything within the heartbeat
//! timeout are closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use datagrid_proto::error::ClientError;
use datagrid_proto::message::{ClientMessage, MessageBody};

use crate::clock::SharedClock;
use crate::cluster_members::ClusterMembers;
use crate::cluster_state::ClusterState;
use crate::options::HeartbeatOptions;

pub struct Heartbeat {
    state: Arc<ClusterState>,
    members: Arc<ClusterMembers>,
    clock: SharedClock,
    period: Duration,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(
        state: Arc<ClusterState>,
        members: Arc<ClusterMembers>,
        options: &HeartbeatOptions,
        clock: SharedClock,
    ) -> Self {
        Self {
            state,
            members,
            clock,
            period: Duration::from_millis(options.period_ms),
            timeout: Duration::from_millis(options.timeout_ms),
        }
    }

    /// Run the checks until `shutdown` flips or the client stops.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.clock.sleep(self.period) => {}
                    _ = shutdown.changed() => break,
                }
                if !self.state.is_active() {
                    break;
                }
                self.check().await;
            }
            debug!("heartbeat: stopped");
        })
    }

    /// One round of checks over the active connections.
    pub async fn check(&self) {
        let now = self.clock.now();
        for conn in self.members.connections() {
            if !conn.is_active() {
                continue;
            }

            let idle_read = now.saturating_duration_since(conn.last_read());
            if idle_read >= self.timeout {
                warn!(
                    "heartbeat: nothing read from {} for {:?}, closing",
                    conn.address(),
                    idle_read
                );
                conn.close(ClientError::HeartbeatTimeout(format!(
                    "no response from {} for {} ms",
                    conn.address(),
                    idle_read.as_millis()
                )));
                continue;
            }

            if now.saturating_duration_since(conn.last_write()) >= self.period {
                let mut ping = ClientMessage::new(MessageBody::Ping);
                ping.correlation_id = self.state.next_correlation_id();
                // Only the read timestamp matters; the pong itself is not awaited.
                if let Err(e) = conn.send_message(&ping).await {
                    debug!("heartbeat: ping to {} failed: {}", conn.address(), e);
                }
            }
        }
    }
}
