//! In-process chat room: one server, two clients, messages relayed to everyone
//! except their author.
//!
//! Run with:
//!   cargo run --example chat --features peer

use std::sync::Arc;

use duplexpipe::peer::{ConnectionEvent, JsonSerializer, PipeClient, PipeServer, ServerEvent};
use duplexpipe::transport::PipeIdentity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let identity = PipeIdentity::local(format!("duplexpipe-chat-{}", std::process::id()));

    let (server, mut server_events) =
        PipeServer::<ChatMessage>::new(identity.clone(), Arc::new(JsonSerializer::new()));
    server.start()?;
    eprintln!("chat room open on {identity}");

    let (alice, _alice_events) = PipeClient::<ChatMessage>::new(identity.clone(), Arc::new(JsonSerializer::new()));
    let (bob, mut bob_events) = PipeClient::<ChatMessage>::new(identity.clone(), Arc::new(JsonSerializer::new()));
    alice.connect().await?;
    bob.connect().await?;

    alice
        .send(&ChatMessage {
            from: "alice".to_string(),
            text: "hi bob".to_string(),
        })
        .await?;

    // Relay the first message to everyone but its author.
    while let Some(event) = server_events.recv().await {
        if let ServerEvent::MessageReceived {
            connection,
            message,
        } = event
        {
            let author = connection.id();
            let report = server
                .send_where(&message, |conn| conn.id() != author)
                .await?;
            eprintln!("relayed to {} client(s)", report.delivered);
            break;
        }
    }

    while let Some(event) = bob_events.recv().await {
        if let ConnectionEvent::MessageReceived(message) = event {
            println!("bob got {:?} from {}", message.text, message.from);
            break;
        }
    }

    alice.disconnect().await;
    bob.disconnect().await;
    server.stop().await;
    Ok(())
}
