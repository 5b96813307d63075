//! Cluster Configuration
//!
//! The `[cluster]` section. Its absence disables clustering entirely;
//! without `multicast.group` only the seed list is used.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use crate::rpc::DEFAULT_RPC_PORT;

/// Cluster membership configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; nodes only talk to members with the same name
    #[serde(default)]
    pub name: Option<String>,

    /// Seed hostnames, separated by `,`, `;` or whitespace
    #[serde(default)]
    pub servers: Option<String>,

    /// Subnet (`a.b.c.d` or `a.b.c.d/bits`) whose local address carries
    /// cluster traffic
    #[serde(default, rename = "localNet", alias = "local_net", alias = "localnet")]
    pub local_net: Option<String>,

    /// Overrides the server name otherwise taken from the hostname
    #[serde(default)]
    pub server_name: Option<String>,

    /// Peer invocation settings
    #[serde(default)]
    pub rmi: RmiConfig,

    /// Gossip settings
    #[serde(default)]
    pub multicast: MulticastConfig,

    /// Period of the reconciliation pass
    /// Default: 30s
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Period of `ping` announcements
    /// Default: 10s
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Whether this node announces itself and answers joins; passive
    /// nodes only observe
    #[serde(default = "default_true")]
    pub active: bool,

    /// Shell command run when a peer asks this node to reload templates.
    /// `TEACLUSTER_RELOAD_ALL` is set to `true` or `false` for the command.
    #[serde(default)]
    pub reload_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RmiConfig {
    /// Registry port
    /// Default: 1099
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MulticastConfig {
    /// Default: 1099
    #[serde(default = "default_port")]
    pub port: u16,

    /// Multicast group; absent disables gossip discovery
    #[serde(default)]
    pub group: Option<Ipv4Addr>,
}

fn default_port() -> u16 {
    DEFAULT_RPC_PORT
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

impl Default for RmiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            group: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: None,
            servers: None,
            local_net: None,
            server_name: None,
            rmi: RmiConfig::default(),
            multicast: MulticastConfig::default(),
            reconcile_interval: default_reconcile_interval(),
            ping_interval: default_ping_interval(),
            active: true,
            reload_command: None,
        }
    }
}

impl ClusterConfig {
    /// Whether any discovery mechanism is configured
    pub fn has_discovery(&self) -> bool {
        self.multicast.group.is_some() || self.servers.is_some()
    }
}
