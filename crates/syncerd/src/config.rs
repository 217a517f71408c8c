//! Configuration for syncerd

use crate::engine::EngineConfig;
use crate::membership::MembershipConfig;
use clap::Parser;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use syncer_core::types::{ClusterId, MemberState, Node, NodeId};

/// Peers contacted per gossip round
const GOSSIP_FANOUT: usize = 3;

/// syncerd - cross-cluster service registry synchronizer
#[derive(Parser, Debug, Clone)]
#[command(name = "syncerd")]
#[command(about = "Synchronizes service registry data across independent clusters")]
pub struct Config {
    /// Node name, unique within the gossip overlay
    #[arg(long, env = "SYNCER_NODE_NAME")]
    pub node_name: String,

    /// Identifier of the local registry cluster
    #[arg(long, env = "SYNCER_CLUSTER")]
    pub cluster: String,

    /// Tags advertised to peers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only sync with peers carrying one of these tags (comma-separated, empty = all)
    #[arg(long, value_delimiter = ',')]
    pub sync_scope: Vec<String>,

    /// Gossip bind address
    #[arg(long, default_value = "127.0.0.1:30190")]
    pub gossip_bind: SocketAddr,

    /// Gossip address advertised to peers (defaults to the bind address)
    #[arg(long)]
    pub gossip_advertise: Option<SocketAddr>,

    /// Gossip seed addresses (comma-separated; empty starts a new overlay)
    #[arg(long, value_delimiter = ',')]
    pub join: Vec<SocketAddr>,

    /// Pull RPC listen address
    #[arg(long, default_value = "127.0.0.1:30191")]
    pub rpc_addr: SocketAddr,

    /// Pull RPC address advertised to peers (defaults to the listen address)
    #[arg(long)]
    pub rpc_advertise: Option<SocketAddr>,

    /// Periodic sync interval in seconds
    #[arg(long, default_value = "30")]
    pub sync_interval_secs: u64,

    /// Per-peer pull timeout in milliseconds
    #[arg(long, default_value = "5000")]
    pub pull_timeout_ms: u64,

    /// Maximum peers reconciled concurrently
    #[arg(long, default_value = "8")]
    pub workers: usize,

    /// Gossip round interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub gossip_interval_ms: u64,

    /// Seconds without heartbeat before a member is marked failed
    #[arg(long, default_value = "10")]
    pub failure_timeout_secs: u64,

    /// Seconds before failed or departed members are forgotten
    #[arg(long, default_value = "60")]
    pub reap_timeout_secs: u64,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/syncerd")]
    pub data_dir: PathBuf,

    /// JSON file of local services loaded into the in-memory registry
    #[arg(long)]
    pub registry_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("Node name cannot be empty");
        }
        if self.cluster.trim().is_empty() {
            anyhow::bail!("Cluster identifier cannot be empty");
        }
        if self.sync_interval_secs == 0 {
            anyhow::bail!("Sync interval must be at least one second");
        }
        if self.pull_timeout_ms == 0 {
            anyhow::bail!("Pull timeout must be positive");
        }
        if self.workers == 0 {
            anyhow::bail!("Worker limit must be positive");
        }
        if self.gossip_interval_ms == 0 {
            anyhow::bail!("Gossip interval must be positive");
        }
        if self.failure_timeout_secs == 0 || self.reap_timeout_secs < self.failure_timeout_secs {
            anyhow::bail!("Reap timeout must be at least the (positive) failure timeout");
        }
        if self.advertised_rpc().ip().is_unspecified() {
            anyhow::bail!("RPC address {} is unspecified; set --rpc-advertise", self.rpc_addr);
        }
        if self.advertised_gossip().ip().is_unspecified() {
            anyhow::bail!(
                "Gossip address {} is unspecified; set --gossip-advertise",
                self.gossip_bind
            );
        }
        if self
            .join
            .iter()
            .any(|seed| *seed == self.gossip_bind || *seed == self.advertised_gossip())
        {
            anyhow::bail!("Seed list must not contain this node's own gossip address");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format '{}' (expected json or pretty)", self.log_format);
        }
        Ok(())
    }

    pub fn cluster_id(&self) -> ClusterId {
        ClusterId::new(self.cluster.trim())
    }

    fn advertised_rpc(&self) -> SocketAddr {
        self.rpc_advertise.unwrap_or(self.rpc_addr)
    }

    fn advertised_gossip(&self) -> SocketAddr {
        self.gossip_advertise.unwrap_or(self.gossip_bind)
    }

    /// This node as advertised to the overlay
    pub fn local_node(&self) -> Node {
        Node {
            id: NodeId::new(self.node_name.trim()),
            rpc_addr: self.advertised_rpc(),
            cluster: self.cluster_id(),
            tags: self.tags.iter().cloned().collect(),
            state: MemberState::Alive,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            local_cluster: self.cluster_id(),
            scope: self.sync_scope.iter().cloned().collect::<BTreeSet<_>>(),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            pull_timeout: Duration::from_millis(self.pull_timeout_ms),
            workers: self.workers,
        }
    }

    pub fn membership_config(&self) -> MembershipConfig {
        let failure_timeout = Duration::from_secs(self.failure_timeout_secs);
        MembershipConfig {
            node: self.local_node(),
            bind_addr: self.gossip_bind,
            advertise_addr: self.advertised_gossip(),
            seeds: self.join.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            fanout: GOSSIP_FANOUT,
            join_timeout: failure_timeout,
            failure_timeout,
            reap_timeout: Duration::from_secs(self.reap_timeout_secs),
        }
    }
}
