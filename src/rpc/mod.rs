//! Peer Invocation
//!
//! A small request/response protocol over TCP standing in for a remote
//! object registry. Each [`RpcRuntime`] owns at most one listener: the
//! first bind creates it on the registry port, or on an ephemeral port
//! when another process already owns the registry, in which case names
//! are bound into that process's registry instead.
//!
//! The runtime is created once by the composition root and shared by every
//! coordinator it builds.

mod client;
mod protocol;
mod registry;
mod server;

pub use client::{RemotePeerStub, RESTART_CALL_TIMEOUT};
pub use protocol::{
    read_frame, write_frame, PeerCall, RpcEnvelope, RpcRequest, RpcResponse, MAX_FRAME_LEN,
    RPC_PROTOCOL_VERSION,
};
pub use registry::{naming_url, MembershipRegistry};
pub use server::RpcServer;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::net::{BoundTransport, LISTEN_BACKLOG};

/// Default port of the registry, as for a Java RMI registry
pub const DEFAULT_RPC_PORT: u16 = 1099;

/// Default limit for a single registry or peer call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer invocation state shared by every coordinator of one process
pub struct RpcRuntime {
    transport: OnceLock<BoundTransport>,
    server: OnceCell<Arc<RpcServer>>,
    call_timeout: Duration,
}

impl RpcRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_call_timeout(DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_call_timeout(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport: OnceLock::new(),
            server: OnceCell::new(),
            call_timeout,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Install the bound transport. Only the first installation takes
    /// effect; returns whether this one did.
    pub fn install_transport(&self, transport: BoundTransport) -> bool {
        match self.transport.set(transport) {
            Ok(()) => {
                info!("Peer invocation will now operate on {}", transport.local_addr());
                true
            }
            Err(_) => {
                if let Some(current) = self.transport.get() {
                    if *current != transport {
                        warn!(
                            "Ignoring transport on {}; already bound to {}",
                            transport.local_addr(),
                            current.local_addr()
                        );
                    }
                }
                false
            }
        }
    }

    pub fn transport(&self) -> Option<&BoundTransport> {
        self.transport.get()
    }

    /// Address used to reach a registry owned by another local process
    pub fn local_registry_host(&self) -> Ipv4Addr {
        self.transport
            .get()
            .map(|t| t.local_addr())
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// The running listener, if a bind has happened
    pub fn server_if_started(&self) -> Option<Arc<RpcServer>> {
        self.server.get().cloned()
    }

    /// Port of the registry this runtime created, if it owns one
    pub fn registry_port(&self) -> Option<u16> {
        self.server
            .get()
            .filter(|s| s.owns_registry())
            .map(|s| s.port())
    }

    /// Get the listener, creating it on first use.
    ///
    /// Creation tries `port` first; if another process holds it the
    /// listener falls back to an ephemeral port and does not own a registry.
    pub async fn server(&self, port: u16) -> Result<Arc<RpcServer>> {
        let server = self
            .server
            .get_or_try_init(|| async { self.create_server(port) })
            .await?;

        if server.owns_registry() && server.port() != port {
            warn!(
                "Registry already created on port {}; reusing it instead of {}",
                server.port(),
                port
            );
        }
        Ok(server.clone())
    }

    fn create_server(&self, port: u16) -> Result<Arc<RpcServer>> {
        match self.listen(port) {
            Ok(listener) => RpcServer::spawn(listener, true),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("{}", ClusterError::TransportBindConflict(port));
                RpcServer::spawn(self.listen(0)?, false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn listen(&self, port: u16) -> io::Result<TcpListener> {
        match self.transport.get() {
            Some(transport) => transport.listen(port),
            None => {
                let socket = TcpSocket::new_v4()?;
                socket.set_reuseaddr(true)?;
                socket.bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))?;
                socket.listen(LISTEN_BACKLOG)
            }
        }
    }

    /// Open a connection, through the bound transport when installed
    pub async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match self.transport.get() {
            Some(transport) => transport.dial(host, port).await,
            None => TcpStream::connect((host, port)).await,
        }
    }

    /// Send one request to `host:port` and wait for its response
    pub async fn call(&self, host: &str, port: u16, request: RpcRequest) -> Result<RpcResponse> {
        self.call_with_timeout(host, port, request, self.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        host: &str,
        port: u16,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        tokio::time::timeout(timeout, self.exchange(host, port, request))
            .await
            .map_err(|_| {
                ClusterError::PeerUnreachable(format!(
                    "{}:{} timed out after {:?}",
                    host, port, timeout
                ))
            })?
    }

    async fn exchange(&self, host: &str, port: u16, request: RpcRequest) -> Result<RpcResponse> {
        let mut stream = self.dial(host, port).await?;
        write_frame(&mut stream, &RpcEnvelope::new(request).encode()?).await?;
        match read_frame(&mut stream).await? {
            Some(frame) => RpcResponse::decode(&frame),
            None => Err(ClusterError::PeerUnreachable(format!(
                "{}:{} closed the connection",
                host, port
            ))),
        }
    }

    /// Stop the listener; exported handles become unreachable
    pub fn shutdown(&self) {
        if let Some(server) = self.server.get() {
            server.shutdown();
        }
    }
}
