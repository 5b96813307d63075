//! Peer Handle Abstraction
//!
//! The contract every cluster member exposes to the others. Implemented by
//! [`LocalPeer`](super::LocalPeer) for the node's own handle and by
//! [`RemotePeerStub`](crate::rpc::RemotePeerStub) for handles living in
//! another process.

use std::fmt;

use async_trait::async_trait;
use bincode::{Decode, Encode};

use crate::error::Result;

/// Stable identity of an exported peer handle.
///
/// `host:port` is the endpoint serving invocations for the handle and
/// `name` the cluster name it is bound under. Two references to the same
/// exported handle always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct PeerRef {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl PeerRef {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
            name: name.into(),
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}/{}", self.host, self.port, self.name)
    }
}

/// Outcome of a template reload on one or more nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct ReloadReport {
    /// Names of the templates that were (re)compiled
    pub reloaded: Vec<String>,
    /// Human readable compilation or invocation failures
    pub errors: Vec<String>,
}

impl ReloadReport {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            reloaded: Vec::new(),
            errors: vec![message.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another node's report into this one, keeping names sorted and unique
    pub fn merge(&mut self, other: ReloadReport) {
        self.reloaded.extend(other.reloaded);
        self.reloaded.sort();
        self.reloaded.dedup();
        self.errors.extend(other.errors);
    }
}

/// The template engine side of a cluster-wide reload.
///
/// Implementations compile templates and report what succeeded and what
/// failed; the membership layer only transports the request and the report.
#[async_trait]
pub trait ReloadHook: Send + Sync {
    /// Reload changed templates, or every template when `all` is set
    async fn reload(&self, all: bool) -> ReloadReport;
}

/// Remote-invocable peer contract.
///
/// Calls on a remote handle fail with
/// [`ClusterError::PeerUnreachable`](crate::ClusterError::PeerUnreachable)
/// when the peer's process is gone; callers drop the peer rather than
/// treating it as a local fault.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Lower-cased server name of the node owning the handle
    async fn server_name(&self) -> Result<String>;

    async fn cluster_name(&self) -> Result<String>;

    /// Snapshot of the peers currently known to the handle
    async fn known_peers(&self) -> Result<Vec<PeerRef>>;

    /// Add a peer; returns false when it was already present
    async fn add_peer(&self, peer: PeerRef) -> Result<bool>;

    /// Remove a peer; returns false when it was not present
    async fn remove_peer(&self, peer: &PeerRef) -> Result<bool>;

    async fn contains_peer(&self, peer: &PeerRef) -> Result<bool>;

    /// Ask the node to reload its templates
    async fn restart(&self, all: bool) -> Result<ReloadReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_peer_ref_identity() {
        let a = PeerRef::new("NodeA", 40001, "tea");
        let b = PeerRef::new("nodea", 40001, "tea");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "//nodea:40001/tea");
        assert_ne!(a, PeerRef::new("nodea", 40002, "tea"));
    }

    #[test]
    fn test_report_merge() {
        let mut total = ReloadReport {
            reloaded: vec!["b".to_string(), "a".to_string()],
            errors: vec![],
        };
        total.merge(ReloadReport {
            reloaded: vec!["a".to_string(), "c".to_string()],
            errors: vec!["c: syntax error".to_string()],
        });

        assert_eq!(
            total,
            ReloadReport {
                reloaded: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                errors: vec!["c: syntax error".to_string()],
            }
        );
        assert!(!total.is_success());
        assert!(ReloadReport::default().is_success());
    }
}
