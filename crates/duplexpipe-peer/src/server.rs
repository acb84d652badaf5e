//! Server acceptor: rendezvous handshake loop plus the live connection registry.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use duplexpipe_frame::{FrameConfig, FrameWriter};
use duplexpipe_transport::{EphemeralChannelName, PipeIdentity, PipeListener, PipeSecurity, PipeStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent};
use crate::error::{PeerError, Result};
use crate::handshake::{handshake_server, HandshakeConfig};
use crate::registry::{BroadcastReport, Registry};
use crate::serializer::SerializerHandle;

/// Default number of concurrent sends during a broadcast.
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 16;

/// Default time one client may take to accept a broadcast frame.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Notifications raised by a [`PipeServer`].
#[derive(Debug)]
pub enum ServerEvent<M> {
    ClientConnected(Connection<M>),
    ClientDisconnected(Connection<M>),
    MessageReceived {
        connection: Connection<M>,
        message: M,
    },
    /// `connection` is `None` for acceptor-level failures such as a broken handshake.
    Exception {
        connection: Option<Connection<M>>,
        error: PeerError,
    },
}

/// Server behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub handshake: HandshakeConfig,
    pub frame: FrameConfig,
    /// Upper bound on sends in flight during one broadcast.
    pub broadcast_concurrency: usize,
    /// How long a broadcast waits on one client before disconnecting it.
    /// `None` waits indefinitely.
    pub send_timeout: Option<Duration>,
    /// Access control applied to the rendezvous and every private channel.
    pub security: PipeSecurity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            security: PipeSecurity::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_broadcast_concurrency(mut self, broadcast_concurrency: usize) -> Self {
        self.broadcast_concurrency = broadcast_concurrency;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Option<Duration>) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_security(mut self, security: PipeSecurity) -> Self {
        self.security = security;
        self
    }
}

/// Accepts any number of clients on one rendezvous pipe.
///
/// Every client is handed a private, uniquely named channel; the resulting
/// connections live in a registry that the `send*` methods fan out over.
pub struct PipeServer<M> {
    shared: Arc<Shared<M>>,
    config: ServerConfig,
    acceptor: Mutex<Option<Acceptor>>,
}

struct Acceptor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared<M> {
    identity: PipeIdentity,
    serializer: SerializerHandle<M>,
    registry: Registry<M>,
    events: UnboundedSender<ServerEvent<M>>,
    supervisors: TaskTracker,
}

impl<M: Send + 'static> PipeServer<M> {
    /// Create a stopped server and the receiver for its events.
    pub fn new(
        identity: PipeIdentity,
        serializer: SerializerHandle<M>,
    ) -> (Self, UnboundedReceiver<ServerEvent<M>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let server = Self {
            shared: Arc::new(Shared {
                identity,
                serializer,
                registry: Registry::new(),
                events,
                supervisors: TaskTracker::new(),
            }),
            config: ServerConfig::default(),
            acceptor: Mutex::new(None),
        };
        (server, rx)
    }

    /// Replace the configuration. Takes effect on the next `start`.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> &PipeIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the rendezvous pipe and start accepting clients.
    pub fn start(&self) -> Result<()> {
        self.start_with(|_| {})
    }

    /// Like [`start`](Self::start), letting `configure` adjust the access
    /// control applied to the pipes this run creates.
    pub fn start_with<F>(&self, configure: F) -> Result<()>
    where
        F: FnOnce(&mut PipeSecurity),
    {
        let mut slot = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|acceptor| !acceptor.task.is_finished()) {
            return Err(PeerError::AlreadyStarted);
        }

        let mut security = self.config.security.clone();
        configure(&mut security);
        let listener = PipeListener::bind_with_security(&self.shared.identity, &security)?;

        let cancel = CancellationToken::new();
        self.shared.supervisors.reopen();
        let acceptor = AcceptLoop {
            shared: Arc::clone(&self.shared),
            handshake: self.config.handshake.clone(),
            frame: self.config.frame.clone(),
            security,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(acceptor.run(listener));

        info!(pipe = %self.shared.identity, "server started");
        *slot = Some(Acceptor { cancel, task });
        Ok(())
    }

    /// Stop accepting, disconnect every client and wait until each one has
    /// been removed from the registry.
    pub async fn stop(&self) {
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(acceptor) = acceptor else {
            return;
        };

        acceptor.cancel.cancel();
        if let Err(err) = acceptor.task.await {
            warn!(pipe = %self.shared.identity, error = %err, "acceptor task failed");
        }

        let members = self.shared.registry.snapshot(|_| true).await;
        debug!(pipe = %self.shared.identity, count = members.len(), "disconnecting clients");
        let mut closing = JoinSet::new();
        for conn in members {
            closing.spawn(async move { conn.disconnect().await });
        }
        while closing.join_next().await.is_some() {}

        self.shared.supervisors.close();
        self.shared.supervisors.wait().await;
        self.shared.registry.drain().await;

        info!(pipe = %self.shared.identity, "server stopped");
    }

    /// Whether the accept loop is running.
    pub fn is_active(&self) -> bool {
        self.acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|acceptor| !acceptor.task.is_finished())
    }

    /// Handles to every connected client.
    pub async fn connections(&self) -> Vec<Connection<M>> {
        self.shared.registry.snapshot(|_| true).await
    }

    /// Send to every connected client.
    pub async fn send(&self, message: &M) -> Result<BroadcastReport> {
        self.send_with_cancel(message, &CancellationToken::new())
            .await
    }

    pub async fn send_with_cancel(
        &self,
        message: &M,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport> {
        self.broadcast(message, |_| true, cancel).await
    }

    /// Send to the client whose private channel is named `pipe_name`,
    /// compared case-insensitively.
    pub async fn send_to(&self, message: &M, pipe_name: &str) -> Result<BroadcastReport> {
        self.send_to_with_cancel(message, pipe_name, &CancellationToken::new())
            .await
    }

    pub async fn send_to_with_cancel(
        &self,
        message: &M,
        pipe_name: &str,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport> {
        self.broadcast(
            message,
            |conn| conn.channel_name().as_str().eq_ignore_ascii_case(pipe_name),
            cancel,
        )
        .await
    }

    /// Send to every connected client matching `predicate`.
    pub async fn send_where<P>(&self, message: &M, predicate: P) -> Result<BroadcastReport>
    where
        P: Fn(&Connection<M>) -> bool,
    {
        self.broadcast(message, predicate, &CancellationToken::new())
            .await
    }

    pub async fn send_where_with_cancel<P>(
        &self,
        message: &M,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport>
    where
        P: Fn(&Connection<M>) -> bool,
    {
        self.broadcast(message, predicate, cancel).await
    }

    /// Serialize `message` once and fan it out to matching clients.
    ///
    /// Per-client failures are reported as [`ServerEvent::Exception`] and
    /// counted in the report; they never fail the call.
    pub async fn broadcast<P>(
        &self,
        message: &M,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport>
    where
        P: Fn(&Connection<M>) -> bool,
    {
        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let payload = Bytes::from(self.shared.serializer.serialize(message)?);

        let events = &self.shared.events;
        let report = self
            .shared
            .registry
            .broadcast(
                payload,
                predicate,
                self.config.broadcast_concurrency,
                self.config.send_timeout,
                cancel,
                |connection, error| {
                    let _ = events.send(ServerEvent::Exception {
                        connection: Some(connection),
                        error,
                    });
                },
            )
            .await;

        if cancel.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        Ok(report)
    }
}

impl<M> std::fmt::Debug for PipeServer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeServer")
            .field("identity", &self.shared.identity)
            .field("config", &self.config)
            .finish()
    }
}

struct AcceptLoop<M> {
    shared: Arc<Shared<M>>,
    handshake: HandshakeConfig,
    frame: FrameConfig,
    security: PipeSecurity,
    cancel: CancellationToken,
}

impl<M: Send + 'static> AcceptLoop<M> {
    async fn run(self, mut listener: PipeListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let rendezvous = match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    self.report_failure(PeerError::Transport(err));
                    // Keep a persistent accept fault from spinning the loop.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let established = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                established = self.establish(rendezvous) => established,
            };

            match established {
                Ok((conn, conn_events)) => self.admit(conn, conn_events).await,
                Err(err) => self.report_failure(err),
            }
        }

        drop(listener);
        info!(pipe = %self.shared.identity, "acceptor stopped");
    }

    /// Hand the client a private channel name and wait for it to connect there.
    async fn establish(
        &self,
        rendezvous: PipeStream,
    ) -> Result<(Connection<M>, UnboundedReceiver<ConnectionEvent<M>>)> {
        let channel = EphemeralChannelName::generate();
        let private_identity = self.shared.identity.private_channel(&channel);

        // Bound before the name goes out so the client never races its creation.
        let mut private = PipeListener::bind_with_security(&private_identity, &self.security)?;

        let mut writer = FrameWriter::with_config(
            rendezvous,
            FrameConfig {
                max_payload_size: self.handshake.max_handshake_payload,
            },
        );
        handshake_server(&mut writer, &channel, &self.handshake).await?;
        drop(writer);

        let stream = tokio::time::timeout(self.handshake.timeout, private.accept())
            .await
            .map_err(|_| PeerError::Timeout(self.handshake.timeout))??;
        drop(private);

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::from_pipe(
            stream,
            self.shared.identity.clone(),
            channel,
            Arc::clone(&self.shared.serializer),
            self.frame.clone(),
            tx,
        );
        Ok((conn, rx))
    }

    async fn admit(&self, conn: Connection<M>, conn_events: UnboundedReceiver<ConnectionEvent<M>>) {
        self.shared.registry.add(conn.clone()).await;
        if let Err(err) = conn.connect() {
            self.shared.registry.remove(conn.id()).await;
            self.report_failure(err);
            return;
        }
        // Events queued since `connect` stay buffered until the supervisor drains them.
        self.shared
            .supervisors
            .spawn(supervise(Arc::clone(&self.shared), conn.clone(), conn_events));
        debug!(
            pipe = %self.shared.identity,
            connection_id = %conn.id(),
            channel = %conn.channel_name(),
            "client admitted"
        );
    }

    fn report_failure(&self, error: PeerError) {
        warn!(pipe = %self.shared.identity, error = %error, "handshake failed; still accepting");
        let _ = self.shared.events.send(ServerEvent::Exception {
            connection: None,
            error,
        });
    }
}

/// Forward one connection's events to the server, removing it from the
/// registry when it disconnects.
async fn supervise<M: Send + 'static>(
    shared: Arc<Shared<M>>,
    conn: Connection<M>,
    mut conn_events: UnboundedReceiver<ConnectionEvent<M>>,
) {
    while let Some(event) = conn_events.recv().await {
        let forwarded = match event {
            ConnectionEvent::Connected => ServerEvent::ClientConnected(conn.clone()),
            ConnectionEvent::MessageReceived(message) => ServerEvent::MessageReceived {
                connection: conn.clone(),
                message,
            },
            ConnectionEvent::Exception(error) => ServerEvent::Exception {
                connection: Some(conn.clone()),
                error,
            },
            ConnectionEvent::Disconnected => {
                shared.registry.remove(conn.id()).await;
                let _ = shared
                    .events
                    .send(ServerEvent::ClientDisconnected(conn.clone()));
                break;
            }
        };
        let _ = shared.events.send(forwarded);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashSet;

    use duplexpipe_frame::FrameReader;
    use duplexpipe_transport::connect_pipe;

    use super::*;
    use crate::client::{ClientConfig, PipeClient};
    use crate::handshake::handshake_client;
    use crate::serializer::JsonSerializer;
    use crate::test_support::{next_event, unique_pipe_path};

    type Server = PipeServer<String>;
    type ServerEvents = UnboundedReceiver<ServerEvent<String>>;
    type Client = PipeClient<String>;
    type ClientEvents = UnboundedReceiver<ConnectionEvent<String>>;

    fn server(tag: &str) -> (Server, ServerEvents, PipeIdentity) {
        let path = unique_pipe_path(tag);
        let identity = PipeIdentity::local(path.to_string_lossy().into_owned());
        let (server, events) = PipeServer::new(identity.clone(), Arc::new(JsonSerializer::new()));
        (server, events, identity)
    }

    fn client(identity: &PipeIdentity) -> (Client, ClientEvents) {
        PipeClient::new(identity.clone(), Arc::new(JsonSerializer::new()))
    }

    fn cleanup(identity: &PipeIdentity) {
        if let Some(parent) = std::path::Path::new(identity.pipe_name()).parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    async fn expect_client_connected(events: &mut ServerEvents) -> Connection<String> {
        match next_event(events).await {
            ServerEvent::ClientConnected(conn) => conn,
            other => panic!("expected ClientConnected, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_round_trip() {
        let (server, mut server_events, identity) = server("roundtrip");
        server.start().unwrap();
        assert!(server.is_active());

        let (client, mut client_events) = client(&identity);
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(matches!(
            next_event(&mut client_events).await,
            ConnectionEvent::Connected
        ));

        let server_side = expect_client_connected(&mut server_events).await;
        assert!(server_side.is_connected());
        let client_side = client.connection().unwrap();
        assert_eq!(server_side.channel_name(), client_side.channel_name());
        assert_eq!(server.connections().await.len(), 1);

        client.send(&"ping".to_string()).await.unwrap();
        match next_event(&mut server_events).await {
            ServerEvent::MessageReceived { connection, message } => {
                assert!(connection.ptr_eq(&server_side));
                assert_eq!(message, "ping");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let report = server.send(&"pong".to_string()).await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert!(matches!(
            next_event(&mut client_events).await,
            ConnectionEvent::MessageReceived(msg) if msg == "pong"
        ));

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_get_distinct_channels() {
        let (server, mut server_events, identity) = server("distinct");
        server.start().unwrap();

        let mut connects = JoinSet::new();
        for _ in 0..6 {
            let identity = identity.clone();
            connects.spawn(async move {
                let (client, events) = client(&identity);
                client.connect().await.map(|()| (client, events))
            });
        }
        let mut clients = Vec::new();
        while let Some(joined) = connects.join_next().await {
            clients.push(joined.unwrap().unwrap());
        }

        let mut names = HashSet::new();
        for _ in 0..6 {
            let conn = expect_client_connected(&mut server_events).await;
            names.insert(conn.channel_name().clone());
        }
        assert_eq!(names.len(), 6);

        let client_names: HashSet<_> = clients
            .iter()
            .map(|(client, _)| client.connection().unwrap().channel_name().clone())
            .collect();
        assert_eq!(client_names, names);

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_disconnects_every_client() {
        let (server, mut server_events, identity) = server("stop");
        server.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, mut events) = client(&identity);
            client.connect().await.unwrap();
            assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));
            expect_client_connected(&mut server_events).await;
            clients.push((client, events));
        }

        server.stop().await;
        assert!(!server.is_active());
        assert!(server.connections().await.is_empty());

        let mut disconnected = 0;
        while let Ok(event) = server_events.try_recv() {
            if matches!(event, ServerEvent::ClientDisconnected(_)) {
                disconnected += 1;
            }
        }
        assert_eq!(disconnected, 3);

        for (client, events) in &mut clients {
            assert!(matches!(next_event(events).await, ConnectionEvent::Disconnected));
            assert!(!client.is_connected());
        }

        let (late, _late_events) = client(&identity);
        let late = late
            .with_config(ClientConfig::default().with_connect_timeout(Duration::from_millis(50)));
        assert!(matches!(late.connect().await, Err(PeerError::Transport(_))));

        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_handshake_does_not_stop_the_acceptor() {
        let (server, mut server_events, identity) = server("broken");
        let server = server.with_config(ServerConfig::default().with_handshake(HandshakeConfig {
            timeout: Duration::from_millis(200),
            ..HandshakeConfig::default()
        }));
        server.start().unwrap();

        let address = identity.address().unwrap();
        let raw = tokio::net::UnixStream::connect(&address).await.unwrap();
        drop(raw);

        match next_event(&mut server_events).await {
            ServerEvent::Exception { connection, .. } => assert!(connection.is_none()),
            other => panic!("expected acceptor exception, got {other:?}"),
        }
        assert!(server.is_active());

        let (client, _events) = client(&identity);
        client.connect().await.unwrap();
        expect_client_connected(&mut server_events).await;

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_to_reaches_only_the_named_client() {
        let (server, mut server_events, identity) = server("sendto");
        server.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client, mut events) = client(&identity);
            client.connect().await.unwrap();
            assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));
            expect_client_connected(&mut server_events).await;
            clients.push((client, events));
        }

        let target = clients[1]
            .0
            .connection()
            .unwrap()
            .channel_name()
            .as_str()
            .to_ascii_uppercase();
        let report = server
            .send_to(&"only you".to_string(), &target)
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });

        assert!(matches!(
            next_event(&mut clients[1].1).await,
            ConnectionEvent::MessageReceived(msg) if msg == "only you"
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(clients[0].1.try_recv().is_err());
        assert!(clients[2].1.try_recv().is_err());

        let report = server
            .send_where(&"odd".to_string(), |conn| conn.id().get() % 2 == 1)
            .await
            .unwrap();
        assert!(report.delivered <= 3);

        server.stop().await;
        cleanup(&identity);
    }

    /// Complete the handshake by hand and keep the private stream without reading it.
    async fn connect_without_reading(identity: &PipeIdentity) -> PipeStream {
        let rendezvous = connect_pipe(identity, Duration::from_secs(2)).await.unwrap();
        let mut reader = FrameReader::new(rendezvous);
        let channel = handshake_client(&mut reader, &HandshakeConfig::default())
            .await
            .unwrap();
        connect_pipe(&identity.private_channel(&channel), Duration::from_secs(2))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_fault_removes_the_client_exactly_once() {
        let (server, mut server_events, identity) = server("stall");
        let server = server.with_config(
            ServerConfig::default().with_send_timeout(Some(Duration::from_millis(100))),
        );
        server.start().unwrap();

        let _held = connect_without_reading(&identity).await;
        let stalled = expect_client_connected(&mut server_events).await;

        // Far larger than any socket buffer, so the write cannot complete.
        let big = "x".repeat(8 * 1024 * 1024);
        let report = tokio::time::timeout(Duration::from_secs(5), server.send(&big))
            .await
            .expect("a stalled client must not hold the broadcast")
            .unwrap();
        assert_eq!(report, BroadcastReport { delivered: 0, failed: 1 });

        let mut disconnected = 0;
        let mut failures = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), server_events.recv()).await
        {
            match event {
                ServerEvent::ClientDisconnected(conn) => {
                    assert!(conn.ptr_eq(&stalled));
                    disconnected += 1;
                }
                ServerEvent::Exception { connection, error } => {
                    assert!(connection.is_some_and(|conn| conn.ptr_eq(&stalled)));
                    assert!(matches!(error, PeerError::Timeout(_)));
                    failures += 1;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(disconnected, 1);
        assert_eq!(failures, 1);
        assert!(server.connections().await.is_empty());

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_releases_a_broadcast_stuck_on_a_stalled_client() {
        let (server, mut server_events, identity) = server("stopstall");
        let server = Arc::new(server.with_config(ServerConfig::default().with_send_timeout(None)));
        server.start().unwrap();

        let _held = connect_without_reading(&identity).await;
        expect_client_connected(&mut server_events).await;

        let sending = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.send(&"x".repeat(8 * 1024 * 1024)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop should not wait on the stalled write");
        let report = tokio::time::timeout(Duration::from_secs(2), sending)
            .await
            .expect("the broadcast should be released")
            .unwrap()
            .unwrap();
        assert_eq!(report.failed, 1);

        cleanup(&identity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_disconnect_removes_registry_member() {
        let (server, mut server_events, identity) = server("leave");
        server.start().unwrap();

        let (client, _events) = client(&identity);
        client.connect().await.unwrap();
        let server_side = expect_client_connected(&mut server_events).await;

        client.disconnect().await;
        match next_event(&mut server_events).await {
            ServerEvent::ClientDisconnected(conn) => assert!(conn.ptr_eq(&server_side)),
            other => panic!("expected ClientDisconnected, got {other:?}"),
        }
        assert!(server.connections().await.is_empty());

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (server, _events, identity) = server("twice");
        server.start().unwrap();
        assert!(matches!(server.start(), Err(PeerError::AlreadyStarted)));

        server.stop().await;
        assert!(!server.is_active());
        server.start().unwrap();
        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test]
    async fn start_with_applies_security() {
        use std::os::unix::fs::PermissionsExt;

        let (server, _events, identity) = server("security");
        server.start_with(|security| security.mode = 0o660).unwrap();

        let mode = std::fs::metadata(identity.address().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o660);

        server.stop().await;
        cleanup(&identity);
    }

    #[tokio::test]
    async fn cancelled_send_is_rejected_up_front() {
        let (server, _events, identity) = server("cancel");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            server.send_with_cancel(&"x".to_string(), &cancel).await,
            Err(PeerError::Cancelled)
        ));
        cleanup(&identity);
    }
}
