//! RPC Listener
//!
//! Serves registry requests and invocations on exported peer handles. The
//! listener that owns the registry port also holds the registry table;
//! listeners started after a bind conflict only serve their exports.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::protocol::{
    read_frame, write_frame, PeerCall, RpcEnvelope, RpcRequest, RpcResponse, RPC_PROTOCOL_VERSION,
};
use crate::error::Result;
use crate::remote::{PeerHandle, PeerRef};

struct Shared {
    owns_registry: bool,
    registry: DashMap<String, PeerRef>,
    exports: DashMap<String, Arc<dyn PeerHandle>>,
}

/// A running RPC listener
pub struct RpcServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    /// Start serving on `listener`
    pub fn spawn(listener: TcpListener, owns_registry: bool) -> Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            owns_registry,
            registry: DashMap::new(),
            exports: DashMap::new(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            "RPC listener on {} ({})",
            local_addr,
            if owns_registry { "registry owner" } else { "exports only" }
        );

        let loop_shared = shared.clone();
        tokio::spawn(async move {
            Self::accept_loop(listener, loop_shared, shutdown_rx).await;
        });

        Ok(Arc::new(Self {
            local_addr,
            shared,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn owns_registry(&self) -> bool {
        self.shared.owns_registry
    }

    /// Make `handle` invocable under `name`, replacing any previous export
    pub fn export(&self, name: &str, handle: Arc<dyn PeerHandle>) {
        self.shared.exports.insert(name.to_string(), handle);
    }

    pub fn unexport(&self, name: &str) -> bool {
        self.shared.exports.remove(name).is_some()
    }

    /// Bind in the local registry table, overwriting any previous binding
    pub fn bind_local(&self, name: &str, target: PeerRef) {
        if let Some(previous) = self.shared.registry.insert(name.to_string(), target) {
            debug!("Rebinding '{}' (was {})", name, previous);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<Shared>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("RPC connection from {}", addr);
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve_connection(stream, shared).await {
                                debug!("RPC connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept RPC connection: {}", e);
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("RPC listener shutting down");
                    return;
                }
            }
        }
    }

    async fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
        while let Some(frame) = read_frame(&mut stream).await? {
            let response = match RpcEnvelope::decode(&frame) {
                Ok(envelope) if envelope.version != RPC_PROTOCOL_VERSION => RpcResponse::Error(
                    format!(
                        "Protocol version mismatch: {} vs {}",
                        envelope.version, RPC_PROTOCOL_VERSION
                    ),
                ),
                Ok(envelope) => Self::dispatch(&shared, envelope.request).await,
                Err(e) => RpcResponse::Error(format!("Decode error: {}", e)),
            };
            write_frame(&mut stream, &response.encode()?).await?;
        }
        Ok(())
    }

    async fn dispatch(shared: &Shared, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Lookup { name } => match shared.registry.get(&name) {
                Some(target) => RpcResponse::Bound(target.value().clone()),
                None => RpcResponse::NotBound(name),
            },
            RpcRequest::Bind { name, target } => {
                if !shared.owns_registry {
                    return RpcResponse::Error("not a registry".to_string());
                }
                info!("Registry: '{}' bound to {}", name, target);
                shared.registry.insert(name, target);
                RpcResponse::Ack
            }
            RpcRequest::List => {
                let mut names: Vec<String> =
                    shared.registry.iter().map(|e| e.key().clone()).collect();
                names.sort();
                RpcResponse::Names(names)
            }
            RpcRequest::Invoke { name, call } => {
                let handle = match shared.exports.get(&name) {
                    Some(handle) => handle.value().clone(),
                    None => return RpcResponse::NotBound(name),
                };
                Self::invoke(handle.as_ref(), call).await
            }
        }
    }

    async fn invoke(handle: &dyn PeerHandle, call: PeerCall) -> RpcResponse {
        let result = match call {
            PeerCall::ServerName => handle.server_name().await.map(RpcResponse::Text),
            PeerCall::ClusterName => handle.cluster_name().await.map(RpcResponse::Text),
            PeerCall::KnownPeers => handle.known_peers().await.map(RpcResponse::Peers),
            PeerCall::AddPeer(peer) => handle.add_peer(peer).await.map(RpcResponse::Flag),
            PeerCall::RemovePeer(peer) => handle.remove_peer(&peer).await.map(RpcResponse::Flag),
            PeerCall::ContainsPeer(peer) => {
                handle.contains_peer(&peer).await.map(RpcResponse::Flag)
            }
            PeerCall::Restart { all } => handle.restart(all).await.map(RpcResponse::Report),
        };
        result.unwrap_or_else(|e| {
            warn!("Peer invocation failed: {}", e);
            RpcResponse::Error(e.to_string())
        })
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
