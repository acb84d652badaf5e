//! Typed duplex messaging over named pipes.
//!
//! A server listens on one well-known pipe and hands every client a private,
//! uniquely named channel; both ends then exchange length-prefixed messages
//! over it. The server can fan a message out to all clients or a selection.
//!
//! # Crate Structure
//!
//! - [`transport`]: pipe naming, listeners and connectors (Unix sockets, Windows named pipes)
//! - [`frame`]: 4-byte length-prefixed framing over async byte streams
//! - [`peer`]: client, server, connections and broadcast (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use duplexpipe_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use duplexpipe_frame::*;
}

/// Re-export client/server types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use duplexpipe_peer::*;
}
