//! Local Peer Handle
//!
//! The handle a node exports for itself: its identity plus the set of
//! peers it currently knows about.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::peer::{PeerHandle, PeerRef, ReloadHook, ReloadReport};
use crate::error::Result;

/// Cluster name reported by handles built without one
pub const UNNAMED_CLUSTER: &str = "Unnamed_Cluster";

/// Cluster name plus an optional explicit server name.
///
/// Without an explicit name the server name is the local hostname,
/// lower-cased, resolved on first use and cached for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub cluster_name: Option<String>,
    pub server_name: Option<String>,
}

impl ClusterIdentity {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: Some(cluster_name.into()),
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }
}

/// Lower-cased local hostname
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().to_lowercase(),
        Err(e) => {
            warn!("Failed to resolve local hostname: {}", e);
            "localhost".to_string()
        }
    }
}

/// Default [`PeerHandle`] implementation held by each node
pub struct LocalPeer {
    cluster_name: String,
    server_name: OnceLock<String>,
    /// Reference under which this handle is exported, once bound
    self_ref: OnceLock<PeerRef>,
    peers: Mutex<Vec<PeerRef>>,
    hook: Option<Arc<dyn ReloadHook>>,
}

impl LocalPeer {
    pub fn new(identity: &ClusterIdentity, hook: Option<Arc<dyn ReloadHook>>) -> Self {
        let server_name = OnceLock::new();
        if let Some(name) = &identity.server_name {
            let _ = server_name.set(name.to_lowercase());
        }
        Self {
            cluster_name: identity
                .cluster_name
                .clone()
                .unwrap_or_else(|| UNNAMED_CLUSTER.to_string()),
            server_name,
            self_ref: OnceLock::new(),
            peers: Mutex::new(Vec::new()),
            hook,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster_name
    }

    /// Server name, resolving the hostname on first call
    pub fn server(&self) -> &str {
        self.server_name.get_or_init(local_hostname)
    }

    /// Record the exported reference; later calls are ignored
    pub fn set_self_ref(&self, peer: PeerRef) {
        let _ = self.self_ref.set(peer);
    }

    pub fn self_ref(&self) -> Option<&PeerRef> {
        self.self_ref.get()
    }

    pub fn peers(&self) -> Vec<PeerRef> {
        self.peers.lock().clone()
    }

    /// Insert unless present or ourselves
    pub fn insert(&self, peer: PeerRef) -> bool {
        if self.self_ref.get() == Some(&peer) {
            debug!("Refusing to add own handle {} as a peer", peer);
            return false;
        }
        let mut peers = self.peers.lock();
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    pub fn remove(&self, peer: &PeerRef) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p != peer);
        peers.len() != before
    }

    pub fn contains(&self, peer: &PeerRef) -> bool {
        self.peers.lock().contains(peer)
    }
}

#[async_trait]
impl PeerHandle for LocalPeer {
    async fn server_name(&self) -> Result<String> {
        Ok(self.server().to_string())
    }

    async fn cluster_name(&self) -> Result<String> {
        Ok(self.cluster_name.clone())
    }

    async fn known_peers(&self) -> Result<Vec<PeerRef>> {
        Ok(self.peers())
    }

    async fn add_peer(&self, peer: PeerRef) -> Result<bool> {
        Ok(self.insert(peer))
    }

    async fn remove_peer(&self, peer: &PeerRef) -> Result<bool> {
        Ok(self.remove(peer))
    }

    async fn contains_peer(&self, peer: &PeerRef) -> Result<bool> {
        Ok(self.contains(peer))
    }

    async fn restart(&self, all: bool) -> Result<ReloadReport> {
        match &self.hook {
            Some(hook) => Ok(hook.reload(all).await),
            None => Ok(ReloadReport::failed(format!(
                "{} has no template reload hook",
                self.server()
            ))),
        }
    }
}
