//! Cluster error types.

use std::fmt;

use crate::config::ConfigError;

/// Errors raised by the membership subsystem.
///
/// Only `NetworkResolution`, `Config` and socket setup failures surface from
/// construction. Everything else is recovered locally by the coordinator or
/// the gossip loop and logged.
#[derive(Debug)]
pub enum ClusterError {
    /// No local address matched the configured subnet
    NetworkResolution(String),
    /// A remote peer invocation failed
    PeerUnreachable(String),
    /// A named peer is not (yet) registered, or its registry did not answer
    LookupFailed(String),
    /// A gossip datagram could not be decoded
    ProtocolDecode(String),
    /// The registry port is owned by another local process
    TransportBindConflict(u16),
    /// The coordinator has no gossip socket (seed-only mode or destroyed)
    NotRunning,
    /// Peer invocation frame could not be encoded or decoded
    Codec(String),
    /// Invalid configuration
    Config(String),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkResolution(msg) => write!(f, "network resolution failed: {}", msg),
            Self::PeerUnreachable(msg) => write!(f, "peer unreachable: {}", msg),
            Self::LookupFailed(msg) => write!(f, "lookup failed: {}", msg),
            Self::ProtocolDecode(msg) => write!(f, "malformed gossip message: {}", msg),
            Self::TransportBindConflict(port) => {
                write!(f, "registry port {} is already owned by another process", port)
            }
            Self::NotRunning => write!(f, "gossip socket is not open"),
            Self::Codec(msg) => write!(f, "codec error: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<ConfigError> for ClusterError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl ClusterError {
    /// Whether the error means the remote side is gone rather than a local fault
    pub fn is_peer_gone(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable(_) | Self::LookupFailed(_) | Self::Io(_)
        )
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
