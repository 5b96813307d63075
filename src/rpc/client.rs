//! Remote Peer Stub
//!
//! Client side of the invocation protocol: a [`PeerHandle`] whose calls
//! travel to the process exporting the referenced handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::protocol::{PeerCall, RpcRequest, RpcResponse};
use super::RpcRuntime;
use crate::error::{ClusterError, Result};
use crate::remote::{PeerHandle, PeerRef, ReloadReport};

/// Per-call limit for `restart`, which waits on template compilation
pub const RESTART_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for a peer living in another process
#[derive(Clone)]
pub struct RemotePeerStub {
    runtime: Arc<RpcRuntime>,
    peer: PeerRef,
}

impl RemotePeerStub {
    pub fn new(runtime: Arc<RpcRuntime>, peer: PeerRef) -> Self {
        Self { runtime, peer }
    }

    pub fn peer_ref(&self) -> &PeerRef {
        &self.peer
    }

    async fn invoke(&self, call: PeerCall, timeout: Duration) -> Result<RpcResponse> {
        let request = RpcRequest::Invoke {
            name: self.peer.name.clone(),
            call,
        };
        let response = self
            .runtime
            .call_with_timeout(&self.peer.host, self.peer.port, request, timeout)
            .await
            .map_err(|e| ClusterError::PeerUnreachable(format!("{}: {}", self.peer, e)))?;

        match response {
            RpcResponse::NotBound(_) => Err(ClusterError::PeerUnreachable(format!(
                "{}: no such exported handle",
                self.peer
            ))),
            RpcResponse::Error(msg) => Err(ClusterError::PeerUnreachable(format!(
                "{}: {}",
                self.peer, msg
            ))),
            other => Ok(other),
        }
    }

    async fn call(&self, call: PeerCall) -> Result<RpcResponse> {
        self.invoke(call, self.runtime.call_timeout()).await
    }

    fn unexpected(&self, response: RpcResponse) -> ClusterError {
        ClusterError::PeerUnreachable(format!(
            "{}: unexpected {} response",
            self.peer,
            response.type_name()
        ))
    }
}

#[async_trait]
impl PeerHandle for RemotePeerStub {
    async fn server_name(&self) -> Result<String> {
        match self.call(PeerCall::ServerName).await? {
            RpcResponse::Text(name) => Ok(name),
            other => Err(self.unexpected(other)),
        }
    }

    async fn cluster_name(&self) -> Result<String> {
        match self.call(PeerCall::ClusterName).await? {
            RpcResponse::Text(name) => Ok(name),
            other => Err(self.unexpected(other)),
        }
    }

    async fn known_peers(&self) -> Result<Vec<PeerRef>> {
        match self.call(PeerCall::KnownPeers).await? {
            RpcResponse::Peers(peers) => Ok(peers),
            other => Err(self.unexpected(other)),
        }
    }

    async fn add_peer(&self, peer: PeerRef) -> Result<bool> {
        match self.call(PeerCall::AddPeer(peer)).await? {
            RpcResponse::Flag(added) => Ok(added),
            other => Err(self.unexpected(other)),
        }
    }

    async fn remove_peer(&self, peer: &PeerRef) -> Result<bool> {
        match self.call(PeerCall::RemovePeer(peer.clone())).await? {
            RpcResponse::Flag(removed) => Ok(removed),
            other => Err(self.unexpected(other)),
        }
    }

    async fn contains_peer(&self, peer: &PeerRef) -> Result<bool> {
        match self.call(PeerCall::ContainsPeer(peer.clone())).await? {
            RpcResponse::Flag(present) => Ok(present),
            other => Err(self.unexpected(other)),
        }
    }

    async fn restart(&self, all: bool) -> Result<ReloadReport> {
        match self
            .invoke(PeerCall::Restart { all }, RESTART_CALL_TIMEOUT)
            .await?
        {
            RpcResponse::Report(report) => Ok(report),
            other => Err(self.unexpected(other)),
        }
    }
}
