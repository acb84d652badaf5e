//! Host-local named pipe primitive.
//!
//! Provides a unified async interface over:
//! - Unix domain sockets (Linux/macOS)
//! - Named pipes (Windows)
//!
//! This is the lowest layer of duplexpipe. Everything else builds on top of
//! the [`PipeStream`] type provided here.

pub mod connect;
pub mod error;
pub mod listener;
pub mod name;
pub mod stream;

pub use connect::connect_pipe;
pub use error::{Result, TransportError};
pub use listener::{PipeListener, PipeSecurity};
pub use name::{validate_pipe_name, EphemeralChannelName, PipeIdentity, LOCAL_HOST, MAX_PIPE_NAME_LEN};
pub use stream::PipeStream;
