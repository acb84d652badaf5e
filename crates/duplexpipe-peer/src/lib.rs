//! Typed client/server messaging over named duplex pipes.
//!
//! A [`PipeServer`] listens on a well-known rendezvous pipe. Each client that
//! arrives is handed the name of a fresh private channel, reconnects there,
//! and from then on talks to the server over its own [`Connection`]. The
//! server keeps every live connection in a registry and can fan messages out
//! to all of them, to one by channel name, or to any predicate-selected set.

pub mod client;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod serializer;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ClientConfig, PipeClient};
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState};
pub use error::{PeerError, Result};
pub use handshake::{handshake_client, handshake_server, HandshakeConfig};
pub use registry::{BroadcastReport, Registry};
pub use serializer::{BytesSerializer, JsonSerializer, Serializer, SerializerError, SerializerHandle};
pub use server::{
    PipeServer, ServerConfig, ServerEvent, DEFAULT_BROADCAST_CONCURRENCY, DEFAULT_SEND_TIMEOUT,
};
