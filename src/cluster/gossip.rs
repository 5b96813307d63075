//! Gossip Transports
//!
//! Datagram carriers for gossip announcements. [`MulticastGossip`] is the
//! production UDP multicast socket; [`MemoryGossipHub`] connects coordinators
//! living in one process, which is how the test suites drive two nodes
//! without multicast routing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::protocol::MAX_PACKET_LEN;
use crate::error::{ClusterError, Result};

/// Carrier of gossip datagrams.
///
/// `recv` must be cancel safe: the gossip loop races it against its stop
/// signal.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Transmit one datagram to every member of the group
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Wait for the next datagram
    async fn recv(&self) -> Result<Bytes>;

    /// Leave the group; later sends and receives fail with `NotRunning`
    fn close(&self);

    /// Short description for log lines
    fn describe(&self) -> String;
}

fn check_len(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PACKET_LEN {
        return Err(ClusterError::Codec(format!(
            "gossip packet of {} bytes exceeds {}",
            payload.len(),
            MAX_PACKET_LEN
        )));
    }
    Ok(())
}

/// UDP multicast socket joined to one group
pub struct MulticastGossip {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
    closed: AtomicBool,
}

impl MulticastGossip {
    /// Bind `port`, then join `group` on `interface` (any interface if
    /// `None`). Must be called inside a tokio runtime.
    pub fn join(group: Ipv4Addr, port: u16, interface: Option<Ipv4Addr>) -> Result<Self> {
        if !group.is_multicast() {
            return Err(ClusterError::Config(format!(
                "{} is not a multicast address",
                group
            )));
        }
        let interface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

        // Announcements never leave the local segment
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!(
            "Joined multicast group {}:{} on {}",
            group, port, interface
        );

        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
            interface,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::NotRunning);
        }
        Ok(())
    }
}

#[async_trait]
impl GossipTransport for MulticastGossip {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_len(payload)?;
        self.socket.send_to(payload, self.group).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        self.ensure_open()?;
        let mut buf = [0u8; MAX_PACKET_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        debug!("Gossip datagram of {} bytes from {}", len, from);
        Ok(Bytes::copy_from_slice(&buf[..len]))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self
            .socket
            .leave_multicast_v4(*self.group.ip(), self.interface)
        {
            warn!("Failed to leave multicast group {}: {}", self.group, e);
        }
    }

    fn describe(&self) -> String {
        format!("multicast {}", self.group)
    }
}

/// Capacity of the in-process gossip channel
const HUB_CAPACITY: usize = 256;

/// In-process stand-in for a multicast group.
///
/// Like a multicast socket with loopback enabled, every endpoint also
/// receives its own datagrams.
#[derive(Clone)]
pub struct MemoryGossipHub {
    tx: broadcast::Sender<Bytes>,
}

impl Default for MemoryGossipHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGossipHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// A new member of the group; it sees datagrams sent from now on
    pub fn endpoint(&self) -> Arc<MemoryGossip> {
        Arc::new(MemoryGossip {
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver a raw datagram to every endpoint
    pub fn inject(&self, payload: impl Into<Bytes>) {
        let _ = self.tx.send(payload.into());
    }
}

/// One member of a [`MemoryGossipHub`]
pub struct MemoryGossip {
    tx: broadcast::Sender<Bytes>,
    rx: Mutex<broadcast::Receiver<Bytes>>,
    closed: AtomicBool,
}

#[async_trait]
impl GossipTransport for MemoryGossip {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::NotRunning);
        }
        check_len(payload)?;
        // No receivers just means nobody is listening yet
        let _ = self.tx.send(Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut rx = self.rx.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ClusterError::NotRunning);
            }
            match rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("In-memory gossip endpoint dropped {} datagrams", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClusterError::NotRunning),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        "in-memory hub".to_string()
    }
}
