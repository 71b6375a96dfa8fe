use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

pub const SNAPSHOT_FILE_NAME: &str = "snapshot.bin";

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Leader,
    Follower,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "replikv",
    about = "Leader-coordinated replicated key-value store",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the key-value HTTP API (default).
    Run,

    /// Decode a snapshot file and print its entries as JSON.
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Snapshot file to read. Defaults to the snapshot under --snapshot-dir.
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "REPLIKV_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "REPLIKV_SNAPSHOT_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub snapshot_dir: PathBuf,

    /// Address other nodes use to reach this node (host:port).
    #[arg(
        long,
        global = true,
        env = "REPLIKV_SELF_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:8080"
    )]
    pub self_addr: String,

    #[arg(
        long,
        global = true,
        env = "REPLIKV_LEADER_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:8080"
    )]
    pub leader_addr: String,

    #[arg(
        long,
        global = true,
        env = "REPLIKV_ROLE",
        value_name = "ROLE",
        default_value = "leader",
        value_enum
    )]
    pub role: NodeRole,

    /// Static replication targets, in fan-out order.
    #[arg(
        long,
        global = true,
        env = "REPLIKV_PEERS",
        value_name = "HOST:PORT",
        value_delimiter = ','
    )]
    pub peers: Vec<String>,

    #[arg(
        long,
        global = true,
        env = "REPLIKV_DISCOVERY_SERVICE",
        value_name = "NAME"
    )]
    pub discovery_service: Option<String>,

    #[arg(
        long,
        global = true,
        env = "REPLIKV_PEER_PORT",
        value_name = "PORT",
        default_value_t = 8080
    )]
    pub peer_port: u16,

    #[arg(
        long = "snapshot-interval-secs",
        global = true,
        env = "REPLIKV_SNAPSHOT_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=86400)
    )]
    pub snapshot_interval_secs: u64,

    #[arg(
        long = "request-timeout-secs",
        global = true,
        env = "REPLIKV_REQUEST_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long = "shutdown-grace-secs",
        global = true,
        env = "REPLIKV_SHUTDOWN_GRACE_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn snapshot_path(&self) -> PathBuf {
        snapshot_path_in(&self.snapshot_dir)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub fn snapshot_path_in(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE_NAME)
}
