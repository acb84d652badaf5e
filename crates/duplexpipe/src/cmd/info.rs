use std::sync::Arc;

use bytes::Bytes;
use duplexpipe_peer::{BytesSerializer, ClientConfig, PipeClient};

use crate::cmd::{parse_duration, InfoArgs};
use crate::exit::{peer_error, transport_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_connection_info, ConnectionInfo, OutputFormat};

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let identity = args.pipe.identity();
    let address = identity
        .address()
        .map_err(|err| transport_error("invalid pipe", err))?;

    let (client, _events) = PipeClient::<Bytes>::new(identity.clone(), Arc::new(BytesSerializer));
    let client = client.with_config(ClientConfig::default().with_connect_timeout(timeout));
    client
        .connect()
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let conn = client
        .connection()
        .ok_or_else(|| CliError::new(FAILURE, "connection closed during probe"))?;
    let credentials = conn.peer_credentials();
    let info = ConnectionInfo {
        pipe: identity.to_string(),
        address: address.display().to_string(),
        channel: conn.channel_name().to_string(),
        connection_id: conn.id().get(),
        connected: conn.is_connected(),
        peer_uid: credentials.map(|(uid, _, _)| uid),
        peer_pid: credentials.map(|(_, _, pid)| pid),
    };
    client.disconnect().await;

    print_connection_info(&info, format);
    Ok(SUCCESS)
}
