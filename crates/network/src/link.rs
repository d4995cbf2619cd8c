//! Byte-level links between peers.
//!
//! Frames are a big-endian `u32` length followed by a bincode-encoded
//! `NetworkMessage`. Links are one-directional: a node writes to the
//! connections it opens and reads from the connections it accepts.

use crate::errors::NetworkError;
use crate::peers::PeerRecord;
use crate::transport::Transport;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use trustmesh_types::NetworkMessage;

/// Writer half of an open connection to one peer.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, message: &NetworkMessage) -> Result<(), NetworkError>;
}

/// Opens outbound connections. Implementations decide how a peer record is
/// reached (direct TCP, SOCKS through an overlay, in-process channels).
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn open(&self, peer: &PeerRecord) -> Result<Box<dyn FrameSink>, NetworkError>;
}

pub fn encode_frame(message: &NetworkMessage, max_frame_bytes: usize) -> Result<Vec<u8>, NetworkError> {
    let body = bincode::serialize(message).map_err(|err| NetworkError::Malformed(err.to_string()))?;
    if body.len() > max_frame_bytes {
        return Err(NetworkError::FrameTooLarge {
            size: body.len(),
            limit: max_frame_bytes,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W>(
    writer: &mut W,
    message: &NetworkMessage,
    max_frame_bytes: usize,
) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin + Send,
{
    let frame = encode_frame(message, max_frame_bytes)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<NetworkMessage>, NetworkError>
where
    R: AsyncRead + Unpin + Send,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > max_frame_bytes {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            limit: max_frame_bytes,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|err| NetworkError::Malformed(err.to_string()))
}

/// A framed TCP stream.
pub struct TcpFrameSink {
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl TcpFrameSink {
    pub fn new(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            stream,
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, message: &NetworkMessage) -> Result<(), NetworkError> {
        write_frame(&mut self.stream, message, self.max_frame_bytes).await
    }
}

/// Direct TCP link to `address:port`.
#[derive(Debug, Clone)]
pub struct TcpLink {
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpLink {
    pub fn new(connect_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            connect_timeout,
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn open(&self, peer: &PeerRecord) -> Result<Box<dyn FrameSink>, NetworkError> {
        let endpoint = peer.endpoint();
        let stream = timeout(self.connect_timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| NetworkError::Timeout(peer.peer_id))?
            .map_err(|err| NetworkError::Unreachable {
                peer: peer.peer_id,
                reason: err.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpFrameSink::new(stream, self.max_frame_bytes)))
    }
}

/// Accept inbound connections and feed every frame to `transport`.
///
/// Runs until the listener fails. Each connection is read on its own task.
pub async fn serve_tcp(listener: TcpListener, transport: Transport) -> Result<(), NetworkError> {
    let local = listener.local_addr()?;
    info!(%local, "accepting peer connections");
    loop {
        let (stream, remote) = listener.accept().await?;
        let transport = transport.clone();
        tokio::spawn(async move {
            read_connection(stream, remote, transport).await;
        });
    }
}

async fn read_connection(mut stream: TcpStream, remote: SocketAddr, transport: Transport) {
    let max_frame_bytes = transport.config().max_frame_bytes;
    loop {
        match read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(message)) => transport.handle_inbound(message).await,
            Ok(None) => {
                debug!(%remote, "peer closed connection");
                return;
            }
            Err(NetworkError::Malformed(reason)) => {
                transport.note_malformed();
                debug!(%remote, %reason, "dropping malformed frame");
            }
            Err(err) => {
                transport.note_malformed();
                warn!(%remote, error = %err, "closing inbound connection");
                return;
            }
        }
    }
}
