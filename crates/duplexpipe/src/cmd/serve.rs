use std::sync::Arc;

use bytes::Bytes;
use duplexpipe_peer::{BytesSerializer, PipeServer, ServerConfig, ServerEvent};
use tracing::{info, warn};

use crate::cmd::{parse_duration, parse_mode, ServeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, MessageSource, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let mode = parse_mode(&args.mode)?;
    let send_timeout = parse_duration(&args.send_timeout)?;
    let identity = args.pipe.identity();
    let config = ServerConfig::default()
        .with_broadcast_concurrency(args.concurrency)
        .with_send_timeout(Some(send_timeout));

    let (server, mut events) = PipeServer::<Bytes>::new(identity, Arc::new(BytesSerializer));
    let server = server.with_config(config);
    server
        .start_with(|security| security.mode = mode)
        .map_err(|err| peer_error("start failed", err))?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut received = 0usize;
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted; shutting down");
                break;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            ServerEvent::ClientConnected(conn) => {
                info!(connection_id = %conn.id(), channel = %conn.channel_name(), "client connected");
            }
            ServerEvent::ClientDisconnected(conn) => {
                info!(connection_id = %conn.id(), "client disconnected");
            }
            ServerEvent::Exception { connection, error } => match connection {
                Some(conn) => warn!(connection_id = %conn.id(), %error, "connection error"),
                None => warn!(%error, "acceptor error"),
            },
            ServerEvent::MessageReceived {
                connection,
                message,
            } => {
                let channel = connection.channel_name().to_string();
                print_message(
                    MessageSource {
                        connection_id: connection.id().get(),
                        channel: &channel,
                    },
                    &message,
                    format,
                );

                if !args.no_relay {
                    let relayed = tokio::select! {
                        _ = &mut shutdown => {
                            info!("interrupted while relaying; shutting down");
                            break;
                        }
                        relayed = server.send(&message) => relayed,
                    };
                    match relayed {
                        Ok(report) if report.failed > 0 => {
                            warn!(delivered = report.delivered, failed = report.failed, "relay incomplete");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "relay failed"),
                    }
                }

                received = received.saturating_add(1);
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
        }
    }

    server.stop().await;
    Ok(SUCCESS)
}
