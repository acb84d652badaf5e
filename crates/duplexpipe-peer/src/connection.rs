//! One established duplex channel.
//!
//! A [`Connection`] owns the frame reader (driven by a background receive loop)
//! and the frame writer (guarded by an async mutex so at most one frame is in
//! flight). Lifecycle changes and inbound messages are delivered as
//! [`ConnectionEvent`]s; `Disconnected` is emitted exactly once and is always
//! the last event of a connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use duplexpipe_frame::{FrameConfig, FrameError, FrameReader, FrameWriter};
use duplexpipe_transport::{EphemeralChannelName, PipeIdentity, PipeStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{PeerError, Result};
use crate::serializer::SerializerHandle;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connected,
    Disconnected,
}

const STATE_CREATED: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_CREATED => Self::Created,
            STATE_CONNECTED => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Notifications raised by a connection.
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    Connected,
    MessageReceived(M),
    Exception(PeerError),
    Disconnected,
}

/// Cloneable handle to one duplex channel.
pub struct Connection<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<M> {
    id: ConnectionId,
    identity: PipeIdentity,
    channel: EphemeralChannelName,
    peer_credentials: Option<(u32, u32, u32)>,
    state: AtomicU8,
    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    writer: tokio::sync::Mutex<Option<FrameWriter<BoxedWriter>>>,
    serializer: SerializerHandle<M>,
    events: UnboundedSender<ConnectionEvent<M>>,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    disconnected_emitted: AtomicBool,
}

impl<M: Send + 'static> Connection<M> {
    /// Wrap an established pipe stream.
    pub fn from_pipe(
        stream: PipeStream,
        identity: PipeIdentity,
        channel: EphemeralChannelName,
        serializer: SerializerHandle<M>,
        frame_config: FrameConfig,
        events: UnboundedSender<ConnectionEvent<M>>,
    ) -> Self {
        let peer_credentials = stream.peer_credentials();
        Self::build(
            stream,
            identity,
            channel,
            serializer,
            frame_config,
            events,
            peer_credentials,
        )
    }

    /// Wrap any duplex byte stream.
    ///
    /// The connection starts in [`ConnectionState::Created`]; call
    /// [`connect`](Self::connect) to start receiving.
    pub fn new<S>(
        stream: S,
        identity: PipeIdentity,
        channel: EphemeralChannelName,
        serializer: SerializerHandle<M>,
        frame_config: FrameConfig,
        events: UnboundedSender<ConnectionEvent<M>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, identity, channel, serializer, frame_config, events, None)
    }

    fn build<S>(
        stream: S,
        identity: PipeIdentity,
        channel: EphemeralChannelName,
        serializer: SerializerHandle<M>,
        frame_config: FrameConfig,
        events: UnboundedSender<ConnectionEvent<M>>,
        peer_credentials: Option<(u32, u32, u32)>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);

        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                identity,
                channel,
                peer_credentials,
                state: AtomicU8::new(STATE_CREATED),
                reader: Mutex::new(Some(FrameReader::with_config(reader, frame_config.clone()))),
                writer: tokio::sync::Mutex::new(Some(FrameWriter::with_config(
                    writer,
                    frame_config,
                ))),
                serializer,
                events,
                cancel: CancellationToken::new(),
                receive_task: Mutex::new(None),
                disconnected_emitted: AtomicBool::new(false),
            }),
        }
    }

    /// Move to `Connected`, emit [`ConnectionEvent::Connected`] and start the
    /// receive loop.
    ///
    /// Fails with `AlreadyConnected` on a live connection and with
    /// `NotConnected` on one that has already been disconnected.
    pub fn connect(&self) -> Result<()> {
        if let Err(current) = self.inner.state.compare_exchange(
            STATE_CREATED,
            STATE_CONNECTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ConnectionState::from_u8(current) {
                ConnectionState::Disconnected => PeerError::NotConnected,
                _ => PeerError::AlreadyConnected,
            });
        }

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return Err(PeerError::AlreadyConnected);
        };

        debug!(
            connection_id = %self.inner.id,
            channel = %self.inner.channel,
            "connection established"
        );
        self.inner.emit(ConnectionEvent::Connected);

        let task = tokio::spawn(receive_loop(Arc::clone(&self.inner), reader));
        *self
            .inner
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Serialize and send one message.
    pub async fn send(&self, message: &M) -> Result<()> {
        self.send_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Serialize and send one message, giving up with `Cancelled` once
    /// `cancel` fires. Cancelling a write already under way also disconnects.
    pub async fn send_with_cancel(&self, message: &M, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        if !self.is_connected() {
            return Err(PeerError::NotConnected);
        }
        let payload = self.inner.serializer.serialize(message)?;
        self.send_payload(&payload, cancel, None).await
    }

    /// Send an already-serialized payload as one frame.
    ///
    /// The writer lock, and the write itself, give way to `cancel`, to
    /// `timeout` and to a concurrent [`disconnect`](Self::disconnect). A
    /// write interrupted part-way leaves the stream unusable, so the writer
    /// is dropped and the connection disconnected.
    pub(crate) async fn send_payload(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        if !self.is_connected() {
            return Err(PeerError::NotConnected);
        }
        let deadline = timeout.map(|after| Instant::now() + after);

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(PeerError::NotConnected),
            _ = expire(deadline) => return Err(PeerError::Timeout(timeout.unwrap_or_default())),
            guard = self.inner.writer.lock() => guard,
        };
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(PeerError::NotConnected);
        };

        let err = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => {
                PeerError::ChannelBroken(FrameError::ConnectionClosed)
            }
            _ = cancel.cancelled() => PeerError::Cancelled,
            _ = expire(deadline) => PeerError::Timeout(timeout.unwrap_or_default()),
            result = writer.write_frame(payload) => match result {
                Ok(()) => {
                    trace!(connection_id = %self.inner.id, len = payload.len(), "frame sent");
                    return Ok(());
                }
                Err(err @ FrameError::PayloadTooLarge { .. }) => return Err(PeerError::Frame(err)),
                Err(err) => PeerError::ChannelBroken(err),
            },
        };
        warn!(connection_id = %self.inner.id, error = %err, "write abandoned; disconnecting");
        guard.take();
        drop(guard);
        self.disconnect().await;
        Err(err)
    }

    /// Close the connection. Idempotent.
    ///
    /// Stops the receive loop, closes the stream and emits
    /// [`ConnectionEvent::Disconnected`] if nothing has emitted it yet.
    pub async fn disconnect(&self) {
        let previous = self.inner.state.swap(STATE_DISCONNECTED, Ordering::AcqRel);
        self.inner.cancel.cancel();

        let task = self
            .inner
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.close_writer().await;

        // A loop that was started emits on its own way out.
        if previous == STATE_CREATED {
            self.inner
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.inner.finish();
        }
    }
}

impl<M> Connection<M> {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The rendezvous identity this connection was established through.
    pub fn identity(&self) -> &PipeIdentity {
        &self.inner.identity
    }

    /// Name of the private channel carrying this connection.
    pub fn channel_name(&self) -> &EphemeralChannelName {
        &self.inner.channel
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Credentials of the process at the other end, as `(uid, gid, pid)`.
    ///
    /// Only available for Unix pipes on Linux.
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        self.inner.peer_credentials
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<M> fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl<M> Inner<M> {
    fn emit(&self, event: ConnectionEvent<M>) {
        // The owner may have dropped its receiver; the connection keeps working.
        let _ = self.events.send(event);
    }

    async fn close_writer(&self) {
        // A send in flight holds the lock; the cancelled token makes it drop the writer itself.
        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                trace!(connection_id = %self.id, error = %err, "shutdown after close failed");
            }
        }
    }

    fn finish(&self) {
        self.state.store(STATE_DISCONNECTED, Ordering::Release);
        if !self.disconnected_emitted.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.id, channel = %self.channel, "connection closed");
            self.emit(ConnectionEvent::Disconnected);
        }
    }
}

/// Resolves at `deadline`, or never without one.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn receive_loop<M: Send + 'static>(
    inner: Arc<Inner<M>>,
    mut reader: FrameReader<BoxedReader>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(payload) => match inner.serializer.deserialize(&payload) {
                Ok(message) => inner.emit(ConnectionEvent::MessageReceived(message)),
                Err(err) => {
                    warn!(connection_id = %inner.id, error = %err, "dropping undecodable message");
                    inner.emit(ConnectionEvent::Exception(PeerError::Serialization(err)));
                }
            },
            Err(FrameError::ConnectionClosed) => {
                debug!(connection_id = %inner.id, "peer closed the channel");
                break;
            }
            Err(err) => {
                warn!(connection_id = %inner.id, error = %err, "receive failed");
                inner.emit(ConnectionEvent::Exception(PeerError::ChannelBroken(err)));
                break;
            }
        }
    }

    drop(reader);
    inner.state.store(STATE_DISCONNECTED, Ordering::Release);
    inner.cancel.cancel();
    inner.close_writer().await;
    inner.finish();
}
