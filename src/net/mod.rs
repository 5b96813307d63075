//! Network Interface Selection
//!
//! Multi-homed hosts must gossip and accept peer invocations on one chosen
//! (usually private) segment rather than whatever interface the OS picks.
//! A `localNet` setting names that segment as `a.b.c.d` (a /24) or
//! `a.b.c.d/bits`; [`resolve_local_net`] picks the host address inside it.

mod transport;

pub use transport::{BoundTransport, LISTEN_BACKLOG};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};

/// Prefix length used when a subnet string carries no `/bits` suffix
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Target subnet for interface selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetSpec {
    net: Ipv4Net,
}

impl SubnetSpec {
    /// Build a subnet from a dotted-quad and prefix length (0..=32)
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        let net = Ipv4Net::new(addr, prefix_len).map_err(|_| {
            ClusterError::Config(format!("invalid prefix length /{}", prefix_len))
        })?;
        Ok(Self { net })
    }

    /// Network address with host bits cleared
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    /// Netmask derived from the prefix length
    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Whether `addr`, masked like the target, equals the target network
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }
}

impl FromStr for SubnetSpec {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, bits)) => {
                let bits = bits.trim().parse::<u8>().map_err(|_| {
                    ClusterError::Config(format!("invalid prefix length in '{}'", s))
                })?;
                (addr.trim(), bits)
            }
            None => (s, DEFAULT_PREFIX_LEN),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| ClusterError::Config(format!("invalid subnet address '{}'", s)))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for SubnetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net.trunc())
    }
}

/// Pick the first candidate address that lies on `spec`.
///
/// Candidates keep their resolution order; IPv6 addresses never match.
pub fn select_address<I>(candidates: I, spec: &SubnetSpec) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = IpAddr>,
{
    candidates.into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if spec.matches(v4) => Some(v4),
        _ => None,
    })
}

/// Resolve `host` and return its address on the `spec` subnet.
pub async fn resolve_local_net(host: &str, spec: &SubnetSpec) -> Result<Ipv4Addr> {
    let candidates: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| {
            ClusterError::NetworkResolution(format!("cannot resolve '{}': {}", host, e))
        })?
        .map(|addr| addr.ip())
        .collect();

    debug!(
        "Addresses of '{}': {:?} (target net {})",
        host, candidates, spec
    );

    match select_address(candidates, spec) {
        Some(addr) => {
            info!("{} matched the specified localNet {}", addr, spec);
            Ok(addr)
        }
        None => Err(ClusterError::NetworkResolution(format!(
            "no address of '{}' is on {}",
            host, spec
        ))),
    }
}
