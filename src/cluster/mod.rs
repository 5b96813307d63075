//! Cluster Module
//!
//! Multicast gossip membership for a fleet of template servers.
//!
//! # Architecture
//!
//! Two channels carry cluster traffic:
//! - **Gossip (UDP multicast)**: `join`, `accept`, `ping` and `leave`
//!   announcements naming the sender's server
//! - **Peer invocation (TCP)**: registry lookups that turn a server name
//!   into a peer reference, and calls on the peer's handle
//!
//! Nodes without multicast fall back to an explicit seed list, resolved on
//! every reconciliation pass.
//!
//! # Usage
//!
//! ```toml
//! # teacluster.toml
//! [cluster]
//! name = "teacluster"
//! servers = "nodea, nodeb"
//! localNet = "10.1.0.0/16"
//!
//! [cluster.multicast]
//! group = "239.255.10.10"
//! port = 1099
//! ```

mod coordinator;
mod gossip;
mod protocol;
mod worker;

#[cfg(test)]
mod tests;

pub use coordinator::{
    parse_seeds, restart_peers, ClusterCoordinator, CoordinatorOptions, DEFAULT_MULTICAST_PORT,
};
pub use gossip::{GossipTransport, MemoryGossip, MemoryGossipHub, MulticastGossip};
pub use protocol::{
    decode_latin1, encode_latin1, is_quit, GossipCommand, GossipMessage, MAX_PACKET_LEN,
    QUIT_MARKER,
};

// Re-export cluster config
pub use crate::config::ClusterConfig;
