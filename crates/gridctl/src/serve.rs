//! `gridctl serve`: stub members on local TCP ports.

use std::net::SocketAddr;

use clap::Args;
use tracing::info;

use datagrid_core::stub::StubCluster;
use datagrid_core::tcp_transport::TcpStubListener;
use datagrid_proto::defaults::DEFAULT_MEMBER_PORT;
use datagrid_proto::message::Credentials;

use crate::common::{exit_error, ConnectArgs};

#[derive(Args)]
pub struct ServeArgs {
    /// Number of stub members
    #[arg(short = 'm', long, default_value_t = 3)]
    pub members: u16,

    /// Port of the first member; the others follow
    #[arg(long, default_value_t = DEFAULT_MEMBER_PORT)]
    pub base_port: u16,

    /// Partition count reported to clients
    #[arg(long)]
    pub partitions: Option<i32>,
}

pub async fn run(args: &ConnectArgs, serve: ServeArgs) {
    let cluster = StubCluster::local(args.cluster_name.clone(), serve.base_port, serve.members);
    if let Some(count) = serve.partitions {
        cluster.set_partition_count(count);
    }
    let credentials = args.credentials();
    if credentials != Credentials::None {
        cluster.require_credentials(credentials);
    }

    let mut listeners = Vec::new();
    for address in cluster.addresses() {
        match TcpStubListener::serve(cluster.clone(), address, address).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => exit_error(&format!("unable to listen on {}: {}", address, e)),
        }
    }

    let addresses: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr())
        .map(|a: SocketAddr| a.to_string())
        .collect();
    println!(
        "cluster {} ({}) serving {} members on {}",
        args.cluster_name,
        cluster.cluster_id(),
        listeners.len(),
        addresses.join(", ")
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        exit_error(&format!("unable to wait for ctrl-c: {}", e));
    }
    info!("serve: shutting down");
    cluster.stop();
    for listener in &listeners {
        listener.shutdown();
    }
}
