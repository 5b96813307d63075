//! Bound Transport
//!
//! TCP connections and listeners pinned to one local address.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use super::{resolve_local_net, SubnetSpec};
use crate::error::Result;

/// Listen backlog for peer invocation listeners
pub const LISTEN_BACKLOG: u32 = 50;

/// Builds outbound connections and inbound listeners on a single local address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundTransport {
    local_addr: Ipv4Addr,
}

impl BoundTransport {
    pub fn new(local_addr: Ipv4Addr) -> Self {
        Self { local_addr }
    }

    /// Resolve `host` against `spec` and bind to the matching address
    pub async fn resolve(host: &str, spec: &SubnetSpec) -> Result<Self> {
        let local_addr = resolve_local_net(host, spec).await?;
        Ok(Self::new(local_addr))
    }

    /// The address every socket is bound to
    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    /// Connect to `host:port`, originating from the bound address
    pub async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let target = resolve_v4(host, port).await?;
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::V4(SocketAddrV4::new(self.local_addr, 0)))?;
        debug!("Dialing {} from {}", target, self.local_addr);
        socket.connect(target).await
    }

    /// Listen on `port` of the bound address (0 picks an ephemeral port)
    pub fn listen(&self, port: u16) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::V4(SocketAddrV4::new(self.local_addr, port)))?;
        socket.listen(LISTEN_BACKLOG)
    }
}

/// Resolve `host:port` to its first IPv4 socket address
pub(crate) async fn resolve_v4(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for '{}'", host),
            )
        })
}
