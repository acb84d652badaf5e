use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duplexpipe_peer::{BytesSerializer, ClientConfig, ConnectionEvent, PeerError, PipeClient};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_message, MessageSource, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let payload = resolve_payload(&args)?;

    let (client, mut events) = PipeClient::<Bytes>::new(args.pipe.identity(), Arc::new(BytesSerializer));
    let client = client.with_config(ClientConfig::default().with_connect_timeout(connect_timeout));
    client
        .connect()
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    client
        .send(&Bytes::from(payload))
        .await
        .map_err(|err| peer_error("send failed", err))?;

    if args.wait {
        let reply = wait_for_reply(&mut events, wait_timeout)
            .await
            .map_err(|err| peer_error("receive failed", err))?;
        if let Some(conn) = client.connection() {
            let channel = conn.channel_name().to_string();
            print_message(
                MessageSource {
                    connection_id: conn.id().get(),
                    channel: &channel,
                },
                &reply,
                format,
            );
        }
    }

    client.disconnect().await;
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

/// Next message on the connection, skipping lifecycle noise.
async fn wait_for_reply(
    events: &mut UnboundedReceiver<ConnectionEvent<Bytes>>,
    timeout: Duration,
) -> Result<Bytes, PeerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| PeerError::Timeout(timeout))?;
        match event {
            Some(ConnectionEvent::MessageReceived(message)) => return Ok(message),
            Some(ConnectionEvent::Connected) => continue,
            Some(ConnectionEvent::Exception(err)) => return Err(err),
            Some(ConnectionEvent::Disconnected) | None => return Err(PeerError::NotConnected),
        }
    }
}
