use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in pipe transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create the server end of a pipe.
    #[error("failed to bind pipe {pipe}: {source}")]
    Bind {
        pipe: String,
        source: std::io::Error,
    },

    /// Failed to open the client end of a pipe.
    #[error("failed to connect to pipe {pipe}: {source}")]
    Connect {
        pipe: String,
        source: std::io::Error,
    },

    /// The pipe did not become available before the connect deadline.
    #[error("timed out after {timeout:?} waiting for pipe {pipe}")]
    ConnectTimeout { pipe: String, timeout: Duration },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the pipe stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The pipe name is empty, too long, or contains forbidden characters.
    #[error("invalid pipe name: {0:?}")]
    InvalidName(String),

    /// The server host cannot be reached with this platform's pipe primitive.
    #[error("pipe host {0:?} is not reachable on this platform (host-local only)")]
    UnsupportedHost(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
