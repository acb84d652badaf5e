//! Server end of the pipe primitive.
//!
//! On Unix a pipe is a filesystem Unix domain socket: the listener is bound
//! once and every `accept` yields the next queued client. On Windows every
//! `accept` connects a fresh pipe-server instance of the same name.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::name::PipeIdentity;
use crate::stream::PipeStream;

/// Access-control descriptor applied when a pipe is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSecurity {
    /// Permission bits for the socket file (Unix).
    pub mode: u32,
    /// Refuse clients connecting from another machine (Windows).
    pub reject_remote_clients: bool,
}

impl PipeSecurity {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
}

impl Default for PipeSecurity {
    fn default() -> Self {
        Self {
            mode: Self::DEFAULT_SOCKET_MODE,
            reject_remote_clients: true,
        }
    }
}

/// Listens for clients on one pipe name.
pub struct PipeListener {
    inner: imp::Listener,
    identity: PipeIdentity,
    address: PathBuf,
}

impl PipeListener {
    /// Create the pipe with default security.
    pub fn bind(identity: &PipeIdentity) -> Result<Self> {
        Self::bind_with_security(identity, &PipeSecurity::default())
    }

    /// Create the pipe with an explicit access-control descriptor.
    pub fn bind_with_security(identity: &PipeIdentity, security: &PipeSecurity) -> Result<Self> {
        let address = identity.address()?;
        let inner = imp::Listener::bind(&address, security)?;
        info!(pipe = %identity, ?address, "listening on pipe");
        Ok(Self {
            inner,
            identity: identity.clone(),
            address,
        })
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> Result<PipeStream> {
        let stream = self.inner.accept().await?;
        debug!(pipe = %self.identity, "accepted pipe client");
        Ok(stream)
    }

    pub fn identity(&self) -> &PipeIdentity {
        &self.identity
    }

    /// Platform address the pipe is bound to.
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        imp::TRANSPORT_NAME
    }
}

impl std::fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeListener")
            .field("identity", &self.identity)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(unix)]
mod imp {
    use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};

    use tokio::net::UnixListener;
    use tracing::debug;

    use super::PipeSecurity;
    use crate::error::{Result, TransportError};
    use crate::stream::PipeStream;

    pub(super) const TRANSPORT_NAME: &str = "unix-domain-socket";

    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    pub(super) struct Listener {
        listener: UnixListener,
        path: PathBuf,
        created_inode: (u64, u64),
    }

    impl Listener {
        pub(super) fn bind(path: &Path, security: &PipeSecurity) -> Result<Self> {
            let path = path.to_path_buf();
            let bind_err = |source| TransportError::Bind {
                pipe: path.display().to_string(),
                source,
            };

            let path_bytes = path.as_os_str().len();
            if path_bytes >= MAX_PATH_LEN {
                return Err(TransportError::PathTooLong {
                    path,
                    len: path_bytes,
                    max: MAX_PATH_LEN,
                });
            }

            // Remove stale socket if it exists, but never remove non-socket files.
            if let Ok(metadata) = std::fs::symlink_metadata(&path) {
                if metadata.file_type().is_socket() {
                    debug!(?path, "removing stale socket");
                    std::fs::remove_file(&path).map_err(bind_err)?;
                } else {
                    return Err(bind_err(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    )));
                }
            }

            let listener = UnixListener::bind(&path).map_err(bind_err)?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(security.mode))
                .map_err(bind_err)?;
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

            Ok(Self {
                listener,
                created_inode: (metadata.dev(), metadata.ino()),
                path,
            })
        }

        pub(super) async fn accept(&mut self) -> Result<PipeStream> {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(TransportError::Accept)?;
            Ok(PipeStream::from_unix(stream))
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            let (expected_dev, expected_ino) = self.created_inode;
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::path::{Path, PathBuf};

    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use super::PipeSecurity;
    use crate::error::{Result, TransportError};
    use crate::stream::PipeStream;

    pub(super) const TRANSPORT_NAME: &str = "named-pipe";

    pub(super) struct Listener {
        path: PathBuf,
        security: PipeSecurity,
        pending: Option<NamedPipeServer>,
    }

    impl Listener {
        pub(super) fn bind(path: &Path, security: &PipeSecurity) -> Result<Self> {
            let first = create_instance(path, security, true)?;
            Ok(Self {
                path: path.to_path_buf(),
                security: security.clone(),
                pending: Some(first),
            })
        }

        pub(super) async fn accept(&mut self) -> Result<PipeStream> {
            let server = match self.pending.take() {
                Some(server) => server,
                None => create_instance(&self.path, &self.security, false)?,
            };
            server.connect().await.map_err(TransportError::Accept)?;
            Ok(PipeStream::from_server(server))
        }
    }

    fn create_instance(path: &Path, security: &PipeSecurity, first: bool) -> Result<NamedPipeServer> {
        ServerOptions::new()
            .first_pipe_instance(first)
            .reject_remote_clients(security.reject_remote_clients)
            .create(path)
            .map_err(|source| TransportError::Bind {
                pipe: path.display().to_string(),
                source,
            })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::connect::connect_pipe;

    fn unique_identity(tag: &str) -> (PipeIdentity, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "dpt-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock = dir.join("test.sock");
        (PipeIdentity::local(sock.to_string_lossy().into_owned()), dir)
    }

    #[tokio::test]
    async fn bind_accept_connect() {
        let (identity, dir) = unique_identity("bind");
        let mut listener = PipeListener::bind(&identity).unwrap();
        assert!(listener.address().exists());
        assert_eq!(listener.transport_name(), "unix-domain-socket");

        let client_identity = identity.clone();
        let client = tokio::spawn(async move {
            let mut stream = connect_pipe(&client_identity, std::time::Duration::from_secs(1))
                .await
                .unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();

        let address = listener.address().to_path_buf();
        drop(listener);
        assert!(!address.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn default_permissions_hardened() {
        let (identity, dir) = unique_identity("perm");
        let listener = PipeListener::bind(&identity).unwrap();
        let mode = std::fs::metadata(listener.address())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn custom_security_mode_applied() {
        let (identity, dir) = unique_identity("mode");
        let security = PipeSecurity {
            mode: 0o660,
            ..PipeSecurity::default()
        };
        let listener = PipeListener::bind_with_security(&identity, &security).unwrap();
        let mode = std::fs::metadata(listener.address())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o660);
        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn rejects_existing_non_socket_file() {
        let (identity, dir) = unique_identity("file");
        std::fs::write(identity.pipe_name(), b"regular-file").unwrap();

        let result = PipeListener::bind(&identity);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn replaces_stale_socket() {
        let (identity, dir) = unique_identity("stale");
        let first = PipeListener::bind(&identity).unwrap();
        std::mem::forget(first);

        let second = PipeListener::bind(&identity);
        assert!(second.is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn path_too_long() {
        let long = format!("/tmp/{}.sock", "a".repeat(200));
        let result = PipeListener::bind(&PipeIdentity::local(long));
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[tokio::test]
    async fn drop_does_not_remove_replaced_path() {
        let (identity, dir) = unique_identity("drop");
        let listener = PipeListener::bind(&identity).unwrap();
        let address = listener.address().to_path_buf();

        std::fs::remove_file(&address).unwrap();
        std::fs::write(&address, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            address.exists(),
            "drop must not remove path if inode identity changed"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
