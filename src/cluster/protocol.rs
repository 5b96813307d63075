//! Gossip Wire Protocol
//!
//! Multicast announcements are single-byte-per-character text of the form
//! `command~clusterName~serverName`, each byte mapping to the Unicode code
//! point of the same value (ISO-8859-1). The message splits at the first and
//! last `~`, so cluster names may themselves contain `~`.

use std::fmt;
use std::str::FromStr;

use crate::error::{ClusterError, Result};

/// Largest datagram sent or received
pub const MAX_PACKET_LEN: usize = 1024;

const SEPARATOR: char = '~';

/// Substring that stops a gossip loop when present anywhere in a packet
pub const QUIT_MARKER: &str = "quit";

/// Gossip command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipCommand {
    /// A node announces itself and asks active members to answer
    Join,
    /// Reply from an active member to a join
    Accept,
    /// Periodic liveness announcement
    Ping,
    /// A node is shutting down
    Leave,
}

impl GossipCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            GossipCommand::Join => "join",
            GossipCommand::Accept => "accept",
            GossipCommand::Ping => "ping",
            GossipCommand::Leave => "leave",
        }
    }
}

impl fmt::Display for GossipCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GossipCommand {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "join" => Ok(GossipCommand::Join),
            "accept" => Ok(GossipCommand::Accept),
            "ping" => Ok(GossipCommand::Ping),
            "leave" => Ok(GossipCommand::Leave),
            other => Err(ClusterError::ProtocolDecode(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

/// A decoded gossip announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub command: GossipCommand,
    pub cluster_name: String,
    pub server_name: String,
}

impl GossipMessage {
    pub fn new(
        command: GossipCommand,
        cluster_name: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            command,
            cluster_name: cluster_name.into(),
            server_name: server_name.into(),
        }
    }

    /// Encode to wire bytes. Characters outside ISO-8859-1 become `?`.
    pub fn encode(&self) -> Vec<u8> {
        encode_latin1(&self.to_string())
    }

    /// Decode a datagram payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::parse(&decode_latin1(payload))
    }

    /// Parse already-decoded text
    pub fn parse(text: &str) -> Result<Self> {
        let first = text.find(SEPARATOR).ok_or_else(|| {
            ClusterError::ProtocolDecode(format!("no separator in '{}'", text))
        })?;
        // rfind never returns an index before `first`
        let last = text.rfind(SEPARATOR).unwrap_or(first);
        if first == last {
            return Err(ClusterError::ProtocolDecode(format!(
                "missing server name in '{}'",
                text
            )));
        }

        let command = text[..first].parse::<GossipCommand>()?;
        Ok(Self {
            command,
            cluster_name: text[first + 1..last].to_string(),
            server_name: text[last + 1..].to_string(),
        })
    }
}

impl fmt::Display for GossipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.command, SEPARATOR, self.cluster_name, SEPARATOR, self.server_name
        )
    }
}

/// Map each byte to the character with the same code point
pub fn decode_latin1(payload: &[u8]) -> String {
    payload.iter().map(|&b| b as char).collect()
}

/// Map each character to one byte, replacing anything above U+00FF
pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Whether a raw payload asks the gossip loop to stop
pub fn is_quit(payload: &[u8]) -> bool {
    decode_latin1(payload).contains(QUIT_MARKER)
}
