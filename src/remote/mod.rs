//! Remote Peer Contract
//!
//! Shared abstractions for cluster membership: the invocable peer handle,
//! its stable reference type, and the reload hook through which a
//! cluster-wide template reload reaches the template engine.

mod local;
mod peer;

pub use local::{local_hostname, ClusterIdentity, LocalPeer, UNNAMED_CLUSTER};
pub use peer::{PeerHandle, PeerRef, ReloadHook, ReloadReport};
