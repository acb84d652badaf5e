//! Price ticker: the server pushes a quote to every subscriber on an interval.
//!
//! Run with:
//!   cargo run --example ticker --features peer

use std::sync::Arc;
use std::time::Duration;

use duplexpipe::peer::{ConnectionEvent, JsonSerializer, PipeClient, PipeServer};
use duplexpipe::transport::PipeIdentity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price_cents: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let identity = PipeIdentity::local(format!("duplexpipe-ticker-{}", std::process::id()));

    let (server, _server_events) =
        PipeServer::<Quote>::new(identity.clone(), Arc::new(JsonSerializer::new()));
    server.start()?;

    let mut subscribers = Vec::new();
    for _ in 0..3 {
        let (client, events) = PipeClient::<Quote>::new(identity.clone(), Arc::new(JsonSerializer::new()));
        client.connect().await?;
        subscribers.push((client, events));
    }

    let mut interval = tokio::time::interval(Duration::from_millis(100));
    for tick in 0..5u64 {
        interval.tick().await;
        let quote = Quote {
            symbol: "ACME".to_string(),
            price_cents: 10_000 + tick * 25,
        };
        let report = server.send(&quote).await?;
        eprintln!("tick {tick}: delivered={} failed={}", report.delivered, report.failed);
    }

    for (idx, (client, events)) in subscribers.iter_mut().enumerate() {
        let mut quotes = 0;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::MessageReceived(quote) = event {
                quotes += 1;
                eprintln!("subscriber {idx}: {} @ {}", quote.symbol, quote.price_cents);
            }
        }
        println!("subscriber {idx} saw {quotes} quote(s)");
        client.disconnect().await;
    }

    server.stop().await;
    Ok(())
}
