//! Rendezvous handshake.
//!
//! The server accepts a client on the well-known rendezvous pipe, writes one
//! frame holding the UTF-8 name of a freshly created private channel, and
//! closes the rendezvous stream. The client reads that frame and reconnects
//! to the named channel. An empty payload is a protocol failure, never a name.

use std::time::Duration;

use duplexpipe_frame::{FrameError, FrameReader, FrameWriter};
use duplexpipe_transport::EphemeralChannelName;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{PeerError, Result};

/// Configuration for the rendezvous handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each handshake step (name exchange, private channel accept).
    pub timeout: Duration,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_handshake_payload: 1024,
        }
    }
}

/// Server side: send the private channel name on the rendezvous stream.
pub async fn handshake_server<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    channel: &EphemeralChannelName,
    config: &HandshakeConfig,
) -> Result<()> {
    tokio::time::timeout(config.timeout, writer.write_frame(channel.as_str().as_bytes()))
        .await
        .map_err(|_| PeerError::Timeout(config.timeout))?
        .map_err(handshake_frame_error)
}

/// Client side: receive the private channel name from the rendezvous stream.
pub async fn handshake_client<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    config: &HandshakeConfig,
) -> Result<EphemeralChannelName> {
    reader.set_max_payload_size(config.max_handshake_payload);

    let payload = tokio::time::timeout(config.timeout, reader.read_frame())
        .await
        .map_err(|_| PeerError::Timeout(config.timeout))?
        .map_err(handshake_frame_error)?;

    if payload.is_empty() {
        return Err(PeerError::HandshakeFailed(
            "server sent an empty channel name".to_string(),
        ));
    }

    let name = std::str::from_utf8(&payload).map_err(|_| {
        PeerError::HandshakeFailed("channel name is not valid UTF-8".to_string())
    })?;

    EphemeralChannelName::parse(name)
        .map_err(|err| PeerError::HandshakeFailed(format!("unusable channel name: {err}")))
}

fn handshake_frame_error(err: FrameError) -> PeerError {
    match err {
        FrameError::ConnectionClosed => {
            PeerError::HandshakeFailed("connection closed during handshake".to_string())
        }
        FrameError::PayloadTooLarge { size, max } => PeerError::HandshakeFailed(format!(
            "handshake payload too large: {size} (max {max})"
        )),
        other => PeerError::Frame(other),
    }
}
