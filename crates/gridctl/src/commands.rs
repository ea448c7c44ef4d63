//! Client-side commands: ping, members, invoke, watch.

use std::time::Duration;

use clap::Args;
use tabled::{Table, Tabled};

use datagrid_core::invocation::InvocationTarget;
use datagrid_proto::member::MemberInfo;
use datagrid_proto::message::{ClientMessage, MessageBody};

use crate::common::{connect, exit_error, ConnectArgs};

#[derive(Args)]
pub struct PingArgs {
    /// Number of pings
    #[arg(short = 'n', long, default_value_t = 3)]
    pub count: u32,

    /// Delay between pings in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,
}

#[derive(Args)]
pub struct InvokeArgs {
    /// Operation name
    pub operation: String,

    /// Request payload (UTF-8)
    #[arg(default_value = "")]
    pub payload: String,

    /// Route to the owner of this partition
    #[arg(short = 'p', long)]
    pub partition: Option<i32>,
}

#[derive(Tabled)]
struct MemberRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Type")]
    kind: &'static str,
}

fn member_rows(members: &[MemberInfo]) -> Vec<MemberRow> {
    members
        .iter()
        .map(|member| MemberRow {
            id: member.id.to_string(),
            address: member.address.to_string(),
            version: member.version.to_string(),
            kind: if member.is_lite_member { "lite" } else { "data" },
        })
        .collect()
}

pub async fn ping(args: &ConnectArgs, ping: PingArgs) {
    let client = connect(args).await;
    for seq in 1..=ping.count {
        match client.ping().await {
            Ok(rtt) => println!("pong from {}: seq={} time={:?}", args.cluster_name, seq, rtt),
            Err(e) => println!("ping seq={} failed: {}", seq, e),
        }
        if seq < ping.count {
            tokio::time::sleep(Duration::from_millis(ping.interval_ms)).await;
        }
    }
    client.shutdown().await;
}

pub async fn members(args: &ConnectArgs) {
    let client = connect(args).await;
    let mut membership = client.subscribe_membership();
    // The member list arrives as a push right after connecting.
    if client.members().is_empty() {
        let _ = tokio::time::timeout(Duration::from_secs(5), membership.recv()).await;
    }

    let members = client.members();
    println!("{}", Table::new(&member_rows(&members)));
    println!();
    println!(
        "Total {} member(s), {} connection(s), cluster {}",
        members.len(),
        client.connection_count(),
        client
            .cluster_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into())
    );
    client.shutdown().await;
}

pub async fn invoke(args: &ConnectArgs, invoke: InvokeArgs) {
    let client = connect(args).await;
    let target = match invoke.partition {
        Some(partition_id) => InvocationTarget::Partition(partition_id),
        None => InvocationTarget::Any,
    };
    let message = ClientMessage::request(invoke.operation, invoke.payload.into_bytes());
    let result = client.invoke(message, target).await;
    client.shutdown().await;

    match result {
        Ok(reply) => match reply.body {
            MessageBody::Response { payload } => {
                println!("{}", String::from_utf8_lossy(&payload))
            }
            other => println!("{:?}", other),
        },
        Err(e) => exit_error(&e.to_string()),
    }
}

pub async fn watch(args: &ConnectArgs) {
    let client = connect(args).await;
    let mut states = client.subscribe_state();
    let mut membership = client.subscribe_membership();
    let mut switched = client.subscribe_cluster_changed();
    println!("connected to {} ({})", args.cluster_name, client.state());

    loop {
        tokio::select! {
            Ok(change) = states.recv() => {
                println!("state: {} -> {}", change.previous, change.current);
                if change.current.is_terminal() {
                    break;
                }
            }
            Ok(event) = membership.recv() => {
                for member in &event.added {
                    println!("member added: {}", member);
                }
                for member in &event.removed {
                    println!("member removed: {}", member);
                }
            }
            Ok(cluster) = switched.recv() => {
                println!("switching to cluster {}", cluster.cluster_name);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.shutdown().await;
}
