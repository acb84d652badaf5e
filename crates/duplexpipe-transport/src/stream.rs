use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected duplex pipe stream implementing `AsyncRead + AsyncWrite`.
///
/// On Unix, this wraps a Unix domain socket stream.
/// On Windows, this wraps either end of a named pipe.
pub struct PipeStream {
    inner: PipeStreamInner,
}

enum PipeStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    Client(tokio::net::windows::named_pipe::NamedPipeClient),
    #[cfg(windows)]
    Server(tokio::net::windows::named_pipe::NamedPipeServer),
}

impl PipeStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: PipeStreamInner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_client(pipe: tokio::net::windows::named_pipe::NamedPipeClient) -> Self {
        Self {
            inner: PipeStreamInner::Client(pipe),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_server(pipe: tokio::net::windows::named_pipe::NamedPipeServer) -> Self {
        Self {
            inner: PipeStreamInner::Server(pipe),
        }
    }

    /// An anonymous connected pair, useful for in-process wiring and tests.
    #[cfg(unix)]
    pub fn pair() -> io::Result<(Self, Self)> {
        let (left, right) = tokio::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            PipeStreamInner::Unix(stream) => stream.as_raw_fd(),
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this stream.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Client(pipe) => Pin::new(pipe).poll_read(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Server(pipe) => Pin::new(pipe).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Client(pipe) => Pin::new(pipe).poll_write(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Server(pipe) => Pin::new(pipe).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            PipeStreamInner::Client(pipe) => Pin::new(pipe).poll_flush(cx),
            #[cfg(windows)]
            PipeStreamInner::Server(pipe) => Pin::new(pipe).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            PipeStreamInner::Client(pipe) => Pin::new(pipe).poll_shutdown(cx),
            #[cfg(windows)]
            PipeStreamInner::Server(pipe) => Pin::new(pipe).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(_) => "unix",
            #[cfg(windows)]
            PipeStreamInner::Client(_) => "named-pipe-client",
            #[cfg(windows)]
            PipeStreamInner::Server(_) => "named-pipe-server",
        };
        f.debug_struct("PipeStream").field("type", &kind).finish()
    }
}
