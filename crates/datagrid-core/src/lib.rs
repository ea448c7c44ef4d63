//! # datagrid-core
//!
//! Client-side cluster connection and resilience layer for the data grid.
//! Keeps authenticated connections to cluster members, fails over between
//! alternate clusters, retries invocations with backoff, and routes
//! requests to members, partitions, or member groups.
//!
//! [`client::GridClient`] is the entry point; the other modules are the
//! parts it wires together.

pub mod client;
pub mod clock;
pub mod cluster_connections;
pub mod cluster_members;
pub mod cluster_state;
pub mod connection_queue;
pub mod failover;
pub mod heartbeat;
pub mod invocation;
pub mod load_balancer;
pub mod member_connection;
pub mod memory_transport;
pub mod messaging;
pub mod options;
pub mod partition_group;
pub mod retry;
pub mod stub;
pub mod tcp_transport;
pub mod transport;

pub use client::GridClient;
pub use invocation::InvocationTarget;
pub use options::ClientOptions;
