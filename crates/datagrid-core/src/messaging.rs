//! Sending invocations to their routing target, with retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::message::ClientMessage;

use crate::clock::SharedClock;
use crate::cluster_members::ClusterMembers;
use crate::cluster_state::ClusterState;
use crate::invocation::{Invocation, InvocationTarget};
use crate::member_connection::MemberConnection;

pub struct ClusterMessaging {
    state: Arc<ClusterState>,
    members: Arc<ClusterMembers>,
    clock: SharedClock,
}

impl ClusterMessaging {
    pub fn new(state: Arc<ClusterState>, members: Arc<ClusterMembers>, clock: SharedClock) -> Self {
        Self {
            state,
            members,
            clock,
        }
    }

    /// Wrap `message` in an invocation for `target`.
    pub fn invocation(&self, message: ClientMessage, target: InvocationTarget) -> Invocation {
        Invocation::new(
            message,
            target,
            self.state.next_correlation_id(),
            &self.state.options().messaging,
            self.clock.clone(),
        )
    }

    pub async fn send(&self, message: ClientMessage, target: InvocationTarget) -> ClientResult<ClientMessage> {
        self.invoke(self.invocation(message, target)).await
    }

    /// Send `invocation` until it succeeds, fails for good, or runs out of
    /// retry time.
    pub async fn invoke(&self, mut invocation: Invocation) -> ClientResult<ClientMessage> {
        loop {
            if !self.state.is_active() {
                return Err(ClientError::ClientNotActive);
            }

            let error = match self.attempt(&invocation).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !invocation.should_retry(&error) {
                debug!(
                    "messaging: invocation {} failed: {}",
                    invocation.correlation_id(),
                    error
                );
                return Err(error);
            }

            debug!(
                "messaging: invocation {} will be retried after: {}",
                invocation.correlation_id(),
                error
            );
            let state = self.state.clone();
            if let Err(timeout) = invocation
                .wait_retry(move || state.next_correlation_id())
                .await
            {
                warn!(
                    "messaging: giving up after {} attempts, last error: {}",
                    invocation.attempts(),
                    error
                );
                return Err(timeout);
            }
        }
    }

    async fn attempt(&self, invocation: &Invocation) -> ClientResult<ClientMessage> {
        let conn = self.resolve(invocation)?;
        let pending = conn.send(invocation).await?;
        let timeout = Duration::from_millis(self.state.options().messaging.invocation_timeout_ms);
        tokio::select! {
            response = pending.wait() => response,
            _ = self.clock.sleep(timeout) => {
                conn.abandon(invocation.correlation_id());
                Err(ClientError::InvocationTimeout)
            }
        }
    }

    fn resolve(&self, invocation: &Invocation) -> ClientResult<Arc<MemberConnection>> {
        match invocation.target() {
            InvocationTarget::Any => self
                .members
                .get_random_connection()
                .ok_or(ClientError::NotConnected),
            InvocationTarget::Member(member_id) => self
                .members
                .get_connection(&member_id)
                .ok_or(ClientError::TargetUnreachable(member_id)),
            InvocationTarget::Partition(partition_id) => self
                .members
                .get_connection_for_partition(partition_id)
                .or_else(|| self.members.get_random_connection())
                .ok_or(ClientError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tokio_clock;
    use crate::cluster_connections::ClusterConnections;
    use crate::memory_transport::MemoryTransport;
    use crate::options::{ClientOptions, ClusterOptions};
    use crate::stub::{StubCluster, OP_NO_REPLY};
    use datagrid_proto::error::ErrorCode;
    use datagrid_proto::message::MessageBody;
    use datagrid_proto::state::ClientState;

    struct Harness {
        cluster: StubCluster,
        members: Arc<ClusterMembers>,
        connections: Arc<ClusterConnections>,
        messaging: ClusterMessaging,
    }

    async fn connected(members_count: u16, tune: impl FnOnce(&mut ClientOptions)) -> Harness {
        let cluster = StubCluster::local("dev", 5701, members_count);
        let mut options = ClientOptions::default();
        options.cluster = ClusterOptions::new("dev", cluster.addresses());
        options.messaging.retry_timeout_secs = 10;
        options.messaging.min_retry_delay_ms = 100;
        tune(&mut options);

        let clock = tokio_clock();
        let state = Arc::new(ClusterState::new(options.clone()).unwrap());
        let members = Arc::new(ClusterMembers::new(&options, clock.clone()));
        let connections = ClusterConnections::new(
            state.clone(),
            members.clone(),
            Arc::new(MemoryTransport::single(cluster.clone())),
            clock.clone(),
        );
        state.change_state(ClientState::Started).await.unwrap();
        connections.connect().await.unwrap();
        for _ in 0..100 {
            if members.connection_count() == members_count as usize
                && members.partition_owner(0).is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Harness {
            cluster,
            messaging: ClusterMessaging::new(state, members.clone(), clock),
            members,
            connections,
        }
    }

    fn echo(payload: &[u8]) -> ClientMessage {
        ClientMessage::request("echo", payload.to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_to_each_target_kind() {
        let h = connected(2, |_| {}).await;
        let member = h.cluster.members()[1].id;

        for target in [
            InvocationTarget::Any,
            InvocationTarget::Member(member),
            InvocationTarget::Partition(1),
        ] {
            let reply = h.messaging.send(echo(b"x"), target).await.unwrap();
            assert_eq!(reply.body, MessageBody::Response { payload: b"x".to_vec() });
        }
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_server_errors() {
        let h = connected(1, |_| {}).await;
        h.cluster
            .fail_next_requests([ErrorCode::PartitionMigrating, ErrorCode::WrongTarget]);

        let invocation = h.messaging.invocation(echo(b"y"), InvocationTarget::Partition(7));
        let first_id = invocation.correlation_id();
        let reply = h.messaging.invoke(invocation).await.unwrap();
        assert!(reply.correlation_id > first_id);
        assert_eq!(h.cluster.request_count(), 3);
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_non_retryable_errors() {
        let h = connected(1, |_| {}).await;
        h.cluster.fail_next_requests([ErrorCode::IllegalArgument]);
        let err = h
            .messaging
            .send(echo(b"z"), InvocationTarget::Any)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Server {
                code: ErrorCode::IllegalArgument,
                ..
            }
        ));
        assert_eq!(h.cluster.request_count(), 1);
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_ends_in_timeout() {
        let h = connected(1, |o| o.messaging.retry_timeout_secs = 2).await;
        h.cluster.fail_next_requests(std::iter::repeat(ErrorCode::Retryable).take(1000));

        let start = tokio::time::Instant::now();
        let err = h
            .messaging
            .send(echo(b"t"), InvocationTarget::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::OperationTimeout { .. }));
        assert_eq!(tokio::time::Instant::now() - start, Duration::from_secs(2));
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_member_is_retried_then_times_out() {
        let h = connected(1, |o| o.messaging.retry_timeout_secs = 1).await;
        let err = h
            .messaging
            .send(echo(b"m"), InvocationTarget::Member(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::OperationTimeout { .. }));
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_surfaced_unless_retry_safe() {
        let h = connected(1, |o| o.connection_retry.cluster_connect_timeout_ms = -1).await;
        let address = h.cluster.addresses()[0];

        let pending = h.messaging.send(ClientMessage::request(OP_NO_REPLY, vec![]), InvocationTarget::Any);
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.cluster.stop_member(address);
        };
        let (result, _) = tokio::join!(pending, stopper);
        assert!(matches!(result, Err(ClientError::TargetDisconnected { .. })));
        h.connections.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout_bounds_each_attempt() {
        let h = connected(1, |o| o.messaging.invocation_timeout_ms = 500).await;
        let start = tokio::time::Instant::now();
        let err = h
            .messaging
            .send(ClientMessage::request(OP_NO_REPLY, vec![]), InvocationTarget::Any)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::InvocationTimeout);
        assert_eq!(tokio::time::Instant::now() - start, Duration::from_millis(500));
        assert_eq!(h.members.connections()[0].pending_count(), 0);
        h.connections.dispose().await;
    }
}
