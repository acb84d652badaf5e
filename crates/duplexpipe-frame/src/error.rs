/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed or reset the stream, possibly in the middle of a frame.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Map an I/O error, folding peer-close kinds into [`FrameError::ConnectionClosed`].
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => FrameError::ConnectionClosed,
            _ => FrameError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
