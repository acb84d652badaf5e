use std::time::Duration;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error (opening or creating a pipe).
    #[error("transport error: {0}")]
    Transport(#[from] duplexpipe_transport::TransportError),

    /// Frame-level error outside an established connection.
    #[error("frame error: {0}")]
    Frame(#[from] duplexpipe_frame::FrameError),

    /// Handshake failed: malformed or empty channel name, or peer closed mid-handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection is not in the connected state.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called on a connection or client that is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// `start` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,

    /// I/O fault on an established connection.
    #[error("channel broken: {0}")]
    ChannelBroken(#[source] duplexpipe_frame::FrameError),

    /// The serializer rejected a message or payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] crate::serializer::SerializerError),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, PeerError>;
