//! Shared helpers for gridctl commands.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, ValueEnum};

use datagrid_core::client::GridClient;
use datagrid_core::options::{ClientOptions, ClusterOptions, ReconnectMode, RoutingMode};
use datagrid_core::tcp_transport::TcpTransport;
use datagrid_proto::defaults::{DEFAULT_CLUSTER_NAME, DEFAULT_FAILOVER_TRY_COUNT};
use datagrid_proto::message::Credentials;

/// How the client connects, shared by every command.
#[derive(Args)]
pub struct ConnectArgs {
    /// Cluster name
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    /// Member address (repeatable)
    #[arg(short = 'a', long = "address", global = true, default_value = "127.0.0.1:5701")]
    pub addresses: Vec<SocketAddr>,

    /// Alternate cluster for failover, as NAME=ADDR[,ADDR...] (repeatable)
    #[arg(long = "failover", global = true, value_parser = parse_cluster)]
    pub failover: Vec<ClusterOptions>,

    /// Full rotations through the failover clusters
    #[arg(long, global = true, default_value_t = DEFAULT_FAILOVER_TRY_COUNT)]
    pub failover_try_count: usize,

    /// Which members to keep connections to
    #[arg(long, global = true, value_enum, default_value_t = Routing::All)]
    pub routing: Routing,

    /// Give up on a cluster after this many milliseconds (-1 retries forever)
    #[arg(long, global = true, allow_hyphen_values = true)]
    pub cluster_connect_timeout_ms: Option<i64>,

    /// Shut down instead of reconnecting when the cluster is lost
    #[arg(long, global = true)]
    pub no_reconnect: bool,

    #[arg(long, global = true, requires = "password")]
    pub username: Option<String>,

    #[arg(long, global = true, requires = "username")]
    pub password: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Routing {
    All,
    Single,
    Multi,
}

impl ConnectArgs {
    pub fn credentials(&self) -> Credentials {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Credentials::UsernamePassword {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Credentials::None,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions {
            client_name: "gridctl".into(),
            ..ClientOptions::default()
        };
        options.cluster = ClusterOptions::new(self.cluster_name.clone(), self.addresses.clone())
            .with_credentials(self.credentials());
        if !self.failover.is_empty() {
            options.failover.enabled = true;
            options.failover.try_count = self.failover_try_count;
            options.failover.clusters = self.failover.clone();
        }
        if let Some(timeout) = self.cluster_connect_timeout_ms {
            options.connection_retry.cluster_connect_timeout_ms = timeout;
        }
        options.routing = match self.routing {
            Routing::All => RoutingMode::AllMembers,
            Routing::Single => RoutingMode::SingleMember,
            Routing::Multi => RoutingMode::MultiMember,
        };
        if self.no_reconnect {
            options.reconnect_mode = ReconnectMode::Off;
        }
        options
    }
}

fn parse_cluster(value: &str) -> Result<ClusterOptions, String> {
    let (name, addresses) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDR[,ADDR...], got {}", value))?;
    let addresses = addresses
        .split(',')
        .map(|a| a.trim().parse::<SocketAddr>().map_err(|e| format!("{}: {}", a, e)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ClusterOptions::new(name, addresses))
}

/// Connect over TCP or exit with an error.
pub async fn connect(args: &ConnectArgs) -> GridClient {
    match GridClient::connect(args.client_options(), Arc::new(TcpTransport::new())).await {
        Ok(client) => client,
        Err(e) => exit_error(&format!("unable to connect to cluster {}: {}", args.cluster_name, e)),
    }
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
