//! Membership Registry
//!
//! Name → peer reference bindings, addressed as `//host:port/name`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::protocol::{RpcRequest, RpcResponse};
use super::{RemotePeerStub, RpcRuntime};
use crate::error::{ClusterError, Result};
use crate::remote::{PeerHandle, PeerRef};

/// Format the naming URL of a binding
pub fn naming_url(host: &str, port: u16, name: &str) -> String {
    format!("//{}:{}/{}", host, port, name)
}

/// Binds local handles and looks up remote ones on a fixed registry port
#[derive(Clone)]
pub struct MembershipRegistry {
    runtime: Arc<RpcRuntime>,
    port: u16,
}

impl MembershipRegistry {
    pub fn new(runtime: Arc<RpcRuntime>, port: u16) -> Self {
        Self { runtime, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn runtime(&self) -> &Arc<RpcRuntime> {
        &self.runtime
    }

    /// Export `handle` and bind it under `name`.
    ///
    /// `advertised_host` is the host peers use to reach this process. When
    /// the registry port belongs to another local process the binding is
    /// made in that registry, overwriting any earlier binding of `name`.
    pub async fn bind(
        &self,
        name: &str,
        handle: Arc<dyn PeerHandle>,
        advertised_host: &str,
    ) -> Result<PeerRef> {
        let server = self.runtime.server(self.port).await?;
        server.export(name, handle);
        let target = PeerRef::new(advertised_host, server.port(), name);

        if server.owns_registry() {
            server.bind_local(name, target.clone());
        } else {
            let registry_host = self.runtime.local_registry_host().to_string();
            self.attach(&registry_host, name, &target).await?;
            info!(
                "Registry reference created for {}:{}",
                registry_host, self.port
            );
        }

        info!("{} bound on {}", name, target);
        Ok(target)
    }

    async fn attach(&self, registry_host: &str, name: &str, target: &PeerRef) -> Result<()> {
        let unreachable = |e: ClusterError| {
            ClusterError::LookupFailed(format!(
                "failed to connect to a valid registry at {}:{}: {}",
                registry_host, self.port, e
            ))
        };

        match self
            .runtime
            .call(registry_host, self.port, RpcRequest::List)
            .await
            .map_err(unreachable)?
        {
            RpcResponse::Names(names) => debug!("Existing registry holds {:?}", names),
            other => {
                return Err(ClusterError::LookupFailed(format!(
                    "registry at {}:{} answered {}",
                    registry_host,
                    self.port,
                    other.type_name()
                )))
            }
        }

        let request = RpcRequest::Bind {
            name: name.to_string(),
            target: target.clone(),
        };
        match self
            .runtime
            .call(registry_host, self.port, request)
            .await
            .map_err(unreachable)?
        {
            RpcResponse::Ack => Ok(()),
            other => Err(ClusterError::LookupFailed(format!(
                "registry at {}:{} refused binding: {:?}",
                registry_host, self.port, other
            ))),
        }
    }

    /// Resolve `//host:port/name` to the bound peer reference
    pub async fn lookup(&self, host: &str, name: &str) -> Result<PeerRef> {
        let url = naming_url(host, self.port, name);
        let request = RpcRequest::Lookup {
            name: name.to_string(),
        };

        match self.runtime.call(host, self.port, request).await {
            Ok(RpcResponse::Bound(target)) => {
                debug!("{} found at {}", url, target);
                Ok(target)
            }
            Ok(RpcResponse::NotBound(_)) => {
                Err(ClusterError::LookupFailed(format!("{} is not bound", url)))
            }
            Ok(other) => {
                warn!("{} answered {}", url, other.type_name());
                Err(ClusterError::LookupFailed(format!(
                    "{} answered {}",
                    url,
                    other.type_name()
                )))
            }
            Err(e) => Err(ClusterError::LookupFailed(format!("{}: {}", url, e))),
        }
    }

    /// List every name bound in the registry at `host`
    pub async fn list(&self, host: &str) -> Result<Vec<String>> {
        match self.runtime.call(host, self.port, RpcRequest::List).await {
            Ok(RpcResponse::Names(names)) => Ok(names),
            Ok(other) => Err(ClusterError::LookupFailed(format!(
                "registry at {}:{} answered {}",
                host,
                self.port,
                other.type_name()
            ))),
            Err(e) => Err(ClusterError::LookupFailed(e.to_string())),
        }
    }

    /// Invocation handle for a looked-up reference
    pub fn stub(&self, peer: PeerRef) -> RemotePeerStub {
        RemotePeerStub::new(self.runtime.clone(), peer)
    }
}
