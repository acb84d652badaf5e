//! Pipe naming: rendezvous identities, ephemeral channel names, and the
//! mapping from a name to the platform address.

use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Result, TransportError};

/// Host value addressing the local machine.
pub const LOCAL_HOST: &str = ".";

/// Maximum accepted pipe name length in bytes.
pub const MAX_PIPE_NAME_LEN: usize = 128;

/// Prefix for socket files created from bare pipe names on Unix.
#[cfg(unix)]
const SOCKET_PREFIX: &str = "duplexpipe-";

/// Address of a rendezvous channel: a pipe name on a server host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeIdentity {
    pipe_name: String,
    server_host: String,
}

impl PipeIdentity {
    /// Identity for `pipe_name` on `server_host`.
    pub fn new(pipe_name: impl Into<String>, server_host: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            server_host: server_host.into(),
        }
    }

    /// Identity for `pipe_name` on the local host.
    pub fn local(pipe_name: impl Into<String>) -> Self {
        Self::new(pipe_name, LOCAL_HOST)
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    /// Whether the host refers to this machine.
    pub fn is_local(&self) -> bool {
        matches!(self.server_host.as_str(), "" | "." | "localhost")
    }

    /// Same host, different pipe name. Used to address an ephemeral channel.
    pub fn with_pipe_name(&self, pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            server_host: self.server_host.clone(),
        }
    }

    /// Identity of the private `channel` handed out on this rendezvous.
    ///
    /// On Unix a rendezvous given as an absolute path keeps its private
    /// sockets in the same directory, so both ends resolve the same address
    /// regardless of their own `$TMPDIR`. Bare names map like any other name.
    pub fn private_channel(&self, channel: &EphemeralChannelName) -> Self {
        #[cfg(unix)]
        {
            let rendezvous = std::path::Path::new(&self.pipe_name);
            if let Some(dir) = rendezvous.parent().filter(|_| rendezvous.is_absolute()) {
                let path = dir.join(format!("{SOCKET_PREFIX}{channel}.sock"));
                return self.with_pipe_name(path.to_string_lossy().into_owned());
            }
        }
        self.with_pipe_name(channel.as_str())
    }

    /// Resolve this identity to the platform address.
    ///
    /// Unix: `$TMPDIR/duplexpipe-<name>.sock`, or the name itself when it is
    /// an absolute path. Windows: `\\<host>\pipe\<name>`.
    pub fn address(&self) -> Result<PathBuf> {
        #[cfg(unix)]
        {
            if !self.is_local() {
                return Err(TransportError::UnsupportedHost(self.server_host.clone()));
            }
            let as_path = std::path::Path::new(&self.pipe_name);
            if as_path.is_absolute() {
                return Ok(as_path.to_path_buf());
            }
            validate_pipe_name(&self.pipe_name)?;
            Ok(std::env::temp_dir().join(format!("{SOCKET_PREFIX}{}.sock", self.pipe_name)))
        }

        #[cfg(windows)]
        {
            validate_pipe_name(&self.pipe_name)?;
            let host = if self.server_host.is_empty() || self.server_host == "localhost" {
                LOCAL_HOST
            } else {
                self.server_host.as_str()
            };
            Ok(PathBuf::from(format!(r"\\{host}\pipe\{}", self.pipe_name)))
        }
    }
}

impl fmt::Display for PipeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            f.write_str(&self.pipe_name)
        } else {
            write!(f, "{}/{}", self.server_host, self.pipe_name)
        }
    }
}

/// Server-generated name of a private per-client data channel.
///
/// Rendered from a random 128-bit UUID; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EphemeralChannelName(String);

impl EphemeralChannelName {
    /// Generate a fresh name.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a name received from a peer, rejecting anything that could not
    /// have been produced as a plain pipe name.
    pub fn parse(name: &str) -> Result<Self> {
        validate_pipe_name(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EphemeralChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EphemeralChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check that `name` is usable as a bare pipe name.
pub fn validate_pipe_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_PIPE_NAME_LEN
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidName(name.to_string()))
    }
}
