//! Datagrid client admin tool (gridctl).
//!
//! Connects to a data-grid cluster through the client connection layer to
//! check that it is reachable, or runs in-process stub members over TCP for
//! trying the client out without a real cluster.
//!
//! # Usage
//!
//! ```text
//! gridctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   ping     Connect and ping the cluster
//!   members  Connect and list the cluster members
//!   invoke   Send one request and print the response
//!   watch    Print lifecycle and membership changes until interrupted
//!   serve    Run stub members on local TCP ports
//!
//! Options:
//!   -c, --cluster-name <NAME>  Cluster name [default: dev]
//!   -a, --address <ADDRESS>    Member address, repeatable [default: 127.0.0.1:5701]
//!       --log-level <FILTER>   Log filter, overrides RUST_LOG
//!   -h, --help                 Print help
//!   -V, --version              Print version
//! ```

mod commands;
mod common;
mod serve;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use common::ConnectArgs;

/// Datagrid client admin tool.
#[derive(Parser)]
#[command(name = "gridctl", version, about = "Datagrid client admin tool")]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Log filter (for example "debug" or "datagrid_core=trace"); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and ping the cluster
    Ping(commands::PingArgs),
    /// Connect and list the cluster members
    Members,
    /// Send one request and print the response
    Invoke(commands::InvokeArgs),
    /// Print lifecycle and membership changes until interrupted
    Watch,
    /// Run stub members on local TCP ports
    Serve(serve::ServeArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Ping(args) => commands::ping(&cli.connect, args).await,
        Commands::Members => commands::members(&cli.connect).await,
        Commands::Invoke(args) => commands::invoke(&cli.connect, args).await,
        Commands::Watch => commands::watch(&cli.connect).await,
        Commands::Serve(args) => serve::run(&cli.connect, args).await,
    }
}
