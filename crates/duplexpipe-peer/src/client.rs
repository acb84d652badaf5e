//! Client connector: rendezvous handshake, then a private duplex channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use duplexpipe_frame::{FrameConfig, FrameReader};
use duplexpipe_transport::{connect_pipe, PipeIdentity};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{Connection, ConnectionEvent};
use crate::error::{PeerError, Result};
use crate::handshake::{handshake_client, HandshakeConfig};
use crate::serializer::SerializerHandle;

/// Client behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the rendezvous pipe to accept us.
    pub connect_timeout: Duration,
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

/// Connects to a [`PipeServer`](crate::server::PipeServer) and holds at most
/// one live [`Connection`].
///
/// There is no automatic reconnection: after a disconnect, call
/// [`connect`](Self::connect) again.
pub struct PipeClient<M> {
    identity: PipeIdentity,
    serializer: SerializerHandle<M>,
    config: ClientConfig,
    events: UnboundedSender<ConnectionEvent<M>>,
    current: Mutex<Option<Connection<M>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl<M: Send + 'static> PipeClient<M> {
    /// Create a disconnected client and the receiver for its events.
    ///
    /// Events from every connection this client opens arrive on the same
    /// receiver.
    pub fn new(
        identity: PipeIdentity,
        serializer: SerializerHandle<M>,
    ) -> (Self, UnboundedReceiver<ConnectionEvent<M>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let client = Self {
            identity,
            serializer,
            config: ClientConfig::default(),
            events,
            current: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        };
        (client, rx)
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> &PipeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<()> {
        self.connect_with_cancel(&CancellationToken::new()).await
    }

    /// Run the handshake and open the private channel.
    ///
    /// Nothing is kept on failure or cancellation: partially opened streams
    /// are dropped before the error is returned.
    pub async fn connect_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let _connecting = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            guard = self.connecting.lock() => guard,
        };
        if self.is_connected() {
            return Err(PeerError::AlreadyConnected);
        }

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            established = self.establish() => established?,
        };
        conn.connect()?;

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(())
    }

    async fn establish(&self) -> Result<Connection<M>> {
        let rendezvous = connect_pipe(&self.identity, self.config.connect_timeout).await?;
        let mut reader = FrameReader::with_config(
            rendezvous,
            FrameConfig {
                max_payload_size: self.config.handshake.max_handshake_payload,
            },
        );
        let channel = handshake_client(&mut reader, &self.config.handshake).await?;
        drop(reader);
        debug!(pipe = %self.identity, %channel, "received private channel name");

        let private = connect_pipe(
            &self.identity.private_channel(&channel),
            self.config.handshake.timeout,
        )
        .await?;

        Ok(Connection::from_pipe(
            private,
            self.identity.clone(),
            channel,
            Arc::clone(&self.serializer),
            self.config.frame.clone(),
            self.events.clone(),
        ))
    }

    /// Close the current connection, if any. Idempotent.
    pub async fn disconnect(&self) {
        let conn = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
    }

    pub async fn send(&self, message: &M) -> Result<()> {
        self.send_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Send on the current connection. Fails fast with `NotConnected` when
    /// there is none; messages are never queued.
    pub async fn send_with_cancel(&self, message: &M, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let conn = self.connection().ok_or(PeerError::NotConnected)?;
        conn.send_with_cancel(message, cancel).await
    }
}

impl<M> PipeClient<M> {
    /// Whether a connection exists and is connected.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Connection::is_connected)
    }

    /// Handle to the current connection, if any.
    pub fn connection(&self) -> Option<Connection<M>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<M> std::fmt::Debug for PipeClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeClient")
            .field("identity", &self.identity)
            .field("connected", &self.is_connected())
            .finish()
    }
}
