//! TeaCluster - cluster membership for template servers
//!
//! Lets a fleet of template-serving processes discover each other over UDP
//! multicast or an explicit seed list, keep a live peer list, and invoke
//! operations such as a template reload on every other member.

pub mod cluster;
pub mod config;
pub mod error;
pub mod hooks;
pub mod net;
pub mod remote;
pub mod rpc;

pub use cluster::{ClusterCoordinator, CoordinatorOptions, GossipCommand, GossipMessage};
pub use config::{ClusterConfig, Config};
pub use error::{ClusterError, Result};
pub use hooks::CommandReloadHook;
pub use net::{BoundTransport, SubnetSpec};
pub use remote::{ClusterIdentity, LocalPeer, PeerHandle, PeerRef, ReloadHook, ReloadReport};
pub use rpc::{MembershipRegistry, RemotePeerStub, RpcRuntime};
