//! Peer Invocation Protocol
//!
//! Requests and responses exchanged with a node's RPC listener, serialized
//! with bincode and framed with a 4-byte big-endian length prefix.

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClusterError, Result};
use crate::remote::{PeerRef, ReloadReport};

/// Protocol version for compatibility checking
pub const RPC_PROTOCOL_VERSION: u8 = 1;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// An invocation on an exported peer handle
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PeerCall {
    ServerName,
    ClusterName,
    KnownPeers,
    AddPeer(PeerRef),
    RemovePeer(PeerRef),
    ContainsPeer(PeerRef),
    Restart { all: bool },
}

/// Requests served by an RPC listener
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RpcRequest {
    /// Resolve a registry binding
    Lookup { name: String },
    /// Bind (or rebind) a name in the registry
    Bind { name: String, target: PeerRef },
    /// List every registry binding
    List,
    /// Invoke a handle exported by this listener
    Invoke { name: String, call: PeerCall },
}

/// Versioned request envelope
#[derive(Debug, Clone, Encode, Decode)]
pub struct RpcEnvelope {
    pub version: u8,
    pub request: RpcRequest,
}

/// Responses to [`RpcRequest`]s
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RpcResponse {
    /// Registry binding found
    Bound(PeerRef),
    /// No binding or no export under the given name
    NotBound(String),
    /// Registry listing
    Names(Vec<String>),
    Ack,
    Text(String),
    Flag(bool),
    Peers(Vec<PeerRef>),
    Report(ReloadReport),
    /// The request was understood but failed
    Error(String),
}

impl RpcEnvelope {
    pub fn new(request: RpcRequest) -> Self {
        Self {
            version: RPC_PROTOCOL_VERSION,
            request,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)?)
    }
}

impl RpcResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)?)
    }

    /// Get the response type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcResponse::Bound(_) => "Bound",
            RpcResponse::NotBound(_) => "NotBound",
            RpcResponse::Names(_) => "Names",
            RpcResponse::Ack => "Ack",
            RpcResponse::Text(_) => "Text",
            RpcResponse::Flag(_) => "Flag",
            RpcResponse::Peers(_) => "Peers",
            RpcResponse::Report(_) => "Report",
            RpcResponse::Error(_) => "Error",
        }
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ClusterError::Codec(format!("frame of {} bytes too large", payload.len())))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Codec(format!("frame of {} bytes too large", len)));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
