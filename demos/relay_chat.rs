//! Example: a relay server and two chat clients on loopback
//!
//! Starts a relaying server on an ephemeral port, connects two clients,
//! exchanges a few messages and shuts everything down again.
//!
//! Run with: `cargo run --example relay_chat`
//! Set `RUST_LOG=netframe=debug` for frame-level tracing.

#![allow(clippy::uninlined_format_args)]

use netframe::config::NetworkConfig;
use netframe::utils::logging::init_logging;
use netframe::{Client, EventDispatcher, EventKind, NetworkEvent, Server};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::default_with_overrides(|config| {
        config.logging.app_name = "relay-chat".to_string();
    });
    config.validate_strict()?;
    init_logging(&config.logging)?;

    let events = EventDispatcher::new();
    events.subscribe(EventKind::ServerStatusChanged, |event| {
        if let NetworkEvent::ServerStatusChanged { status } = event {
            println!("[server] {}", status);
        }
    })?;
    events.subscribe(EventKind::ConnectionStatusChanged, |event| {
        if let NetworkEvent::ConnectionStatusChanged { connection, status } = event {
            println!("[server] {} ({}) is {}", connection.id, connection.remote, status);
        }
    })?;

    let server = Server::builder()
        .network_config(&config)
        .events(events)
        .build();
    let running = server.clone();
    let accept_loop = tokio::spawn(async move { running.start(0).await });

    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    println!("Relay listening on {}", addr);

    let alice = Client::from_network_config(&config, EventDispatcher::new());
    let bob = Client::from_network_config(&config, EventDispatcher::new());
    alice.connect("127.0.0.1", addr.port()).await?;
    bob.connect("127.0.0.1", addr.port()).await?;

    alice.send_message("hi bob").await?;
    bob.send_message("hello alice").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for (name, client) in [("alice", &alice), ("bob", &bob)] {
        for message in client.queue().drain() {
            println!("{} received: {}", name, message.text());
        }
    }

    let report = server.broadcast_message("server going down").await;
    println!(
        "Broadcast delivered to {} connection(s), {} failed",
        report.delivered.len(),
        report.failed.len()
    );

    alice.disconnect().await?;
    bob.disconnect().await?;
    server.stop().await?;
    accept_loop.await??;

    let snapshot = server.metrics().snapshot();
    println!(
        "Server handled {} connection(s), {} message(s) in, {} out",
        snapshot.connections_total, snapshot.messages_received, snapshot.messages_sent
    );
    Ok(())
}
