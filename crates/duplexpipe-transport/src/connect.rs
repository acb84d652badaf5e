use std::io::ErrorKind;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::name::PipeIdentity;
use crate::stream::PipeStream;

/// Delay between attempts while the server end is not yet available.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Open the client end of a pipe, waiting up to `timeout` for the server end
/// to exist and have a free instance.
pub async fn connect_pipe(identity: &PipeIdentity, timeout: Duration) -> Result<PipeStream> {
    let address = identity.address()?;
    let deadline = Instant::now() + timeout;

    loop {
        match open(&address).await {
            Ok(stream) => {
                debug!(pipe = %identity, "connected to pipe");
                return Ok(stream);
            }
            Err(err) if is_not_ready(&err) => {
                if Instant::now() >= deadline {
                    return Err(TransportError::ConnectTimeout {
                        pipe: identity.to_string(),
                        timeout,
                    });
                }
                trace!(pipe = %identity, error = %err, "pipe not ready; retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    pipe: identity.to_string(),
                    source,
                });
            }
        }
    }
}

#[cfg(unix)]
async fn open(address: &std::path::Path) -> std::io::Result<PipeStream> {
    let stream = tokio::net::UnixStream::connect(address).await?;
    Ok(PipeStream::from_unix(stream))
}

#[cfg(windows)]
async fn open(address: &std::path::Path) -> std::io::Result<PipeStream> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(address)?;
    Ok(PipeStream::from_client(client))
}

/// Errors meaning "the server end is not there yet", not "the pipe is broken".
fn is_not_ready(err: &std::io::Error) -> bool {
    if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) {
        return true;
    }
    #[cfg(windows)]
    {
        if err.raw_os_error() == Some(windows_sys::Win32::Foundation::ERROR_PIPE_BUSY as i32) {
            return true;
        }
    }
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::listener::PipeListener;

    fn unique_identity(tag: &str) -> PipeIdentity {
        PipeIdentity::local(format!(
            "dpc-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[tokio::test]
    async fn times_out_when_nobody_listens() {
        let identity = unique_identity("absent");
        let result = connect_pipe(&identity, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
    }

    #[tokio::test]
    async fn waits_for_listener_created_later() {
        let identity = unique_identity("late");
        let server_identity = identity.clone();

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut listener = PipeListener::bind(&server_identity).unwrap();
            let _stream = listener.accept().await.unwrap();
        });

        let stream = connect_pipe(&identity, Duration::from_secs(2)).await;
        assert!(stream.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn remote_host_is_rejected_without_retry() {
        let identity = PipeIdentity::new("orders", "elsewhere");
        let result = connect_pipe(&identity, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::UnsupportedHost(_))));
    }
}
