#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests over loopback TCP: relay, broadcast, lifecycle and
//! registry bookkeeping.

mod common;

use common::{eventually, record, spawn_server};
use netframe::config::ServerConfig;
use netframe::protocol::events::EventKind;
use netframe::{
    Client, ConnectionInfo, ConnectionStatus, DispatchPolicy, EventDispatcher, MessageKind,
    NetworkEvent, NetworkMessage, Origin, Server, ServerStatus, TransportError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

async fn connected_client(port: u16) -> Client {
    let client = Client::new(EventDispatcher::new());
    client.connect("127.0.0.1", port).await.unwrap();
    client
}

async fn wait_for_connections(server: &Server, count: usize) {
    eventually("server connection count", || {
        let server = server.clone();
        async move { server.connection_count().await == count }
    })
    .await;
}

async fn wait_for_message(client: &Client) -> NetworkMessage {
    let queue = client.queue().clone();
    eventually("a queued message", || {
        let queue = queue.clone();
        async move { !queue.is_empty() }
    })
    .await;
    queue.try_dequeue().unwrap()
}

fn statuses(events: &[NetworkEvent]) -> Vec<ConnectionStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            NetworkEvent::ClientStatusChanged { status } => Some(*status),
            NetworkEvent::ConnectionStatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// ============================================================================
// RELAY
// ============================================================================

#[tokio::test]
async fn test_hello_is_relayed_to_other_client() {
    let server = Server::new(EventDispatcher::new());
    let (addr, handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    let b = connected_client(addr.port()).await;
    wait_for_connections(&server, 2).await;

    a.send_message("hello").await.unwrap();

    let at_b = wait_for_message(&b).await;
    assert_eq!(at_b.kind(), MessageKind::Message);
    assert_eq!(at_b.as_str(), Some("hello"));
    // Relay includes the sender
    assert_eq!(wait_for_message(&a).await.text(), "hello");

    a.disconnect().await.unwrap();
    b.disconnect().await.unwrap();
    wait_for_connections(&server, 0).await;

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_relay_to_others_skips_sender() {
    let server = Server::builder()
        .policy(DispatchPolicy::RelayToOthers)
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    let b = connected_client(addr.port()).await;
    wait_for_connections(&server, 2).await;

    a.send_message("ping").await.unwrap();
    assert_eq!(wait_for_message(&b).await.text(), "ping");

    b.send_message("pong").await.unwrap();
    assert_eq!(wait_for_message(&a).await.text(), "pong");
    assert!(a.queue().is_empty());
    assert!(b.queue().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_callback_policy_receives_sender_info() {
    let seen: Arc<Mutex<Vec<(ConnectionInfo, String)>>> = Arc::default();
    let sink = seen.clone();
    let server = Server::builder()
        .policy(DispatchPolicy::callback(move |from, message| {
            sink.lock().unwrap().push((from, message.text().into_owned()));
        }))
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    wait_for_connections(&server, 1).await;
    a.send_message("to the app").await.unwrap();

    eventually("callback to run", || {
        let seen = seen.clone();
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await;

    let (from, text) = seen.lock().unwrap()[0].clone();
    assert_eq!(text, "to the app");
    assert_eq!(Some(from.remote), a.local_addr().await);
    // Nothing is rebroadcast under a callback policy
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(a.queue().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_frames_raise_events_only() {
    let events = EventDispatcher::new();
    let streams = record(&events, EventKind::StreamReceived);
    let server = Server::new(events);
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    wait_for_connections(&server, 1).await;
    a.send_stream(vec![0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

    eventually("stream event", || {
        let streams = streams.clone();
        async move { !streams.lock().unwrap().is_empty() }
    })
    .await;

    let local = a.local_addr().await.unwrap();
    match &streams.lock().unwrap()[0] {
        NetworkEvent::StreamReceived {
            origin: Origin::Connection(info),
            data,
        } => {
            assert_eq!(info.remote, local);
            assert_eq!(&data[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(a.queue().is_empty());

    server.stop().await.unwrap();
}

// ============================================================================
// BROADCAST AND DIRECT SENDS
// ============================================================================

#[tokio::test]
async fn test_stuck_peer_does_not_delay_others() {
    let server = Server::builder()
        .policy(DispatchPolicy::RelayToOthers)
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    // Connected but never reads, so its socket buffers fill up
    let stuck = TcpStream::connect(addr).await.unwrap();
    let c = connected_client(addr.port()).await;
    wait_for_connections(&server, 3).await;

    // Far more than loopback socket buffers hold
    let bulk = "x".repeat(1024 * 1024);
    for _ in 0..16 {
        a.send_message(&bulk).await.unwrap();
    }
    a.send_message("one").await.unwrap();
    a.send_message("two").await.unwrap();

    let queue = c.queue().clone();
    tokio::time::timeout(Duration::from_secs(3), async {
        while queue.len() < 18 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay to a reading peer held up by one that is not reading");

    let received = queue.drain();
    assert!(received[..16].iter().all(|m| m.text().len() == bulk.len()));
    assert_eq!(received[16].text(), "one");
    assert_eq!(received[17].text(), "two");
    assert!(c.is_connected());

    drop(stuck);
    wait_for_connections(&server, 2).await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_to_and_disconnect_client() {
    let server = Server::new(EventDispatcher::new());
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    let b = connected_client(addr.port()).await;
    wait_for_connections(&server, 2).await;

    let a_local = a.local_addr().await.unwrap();
    let a_info = server
        .connections()
        .await
        .into_iter()
        .find(|info| info.remote == a_local)
        .expect("a is registered");

    server
        .send_to(a_info.id, MessageKind::Message, "just you")
        .await
        .unwrap();
    assert_eq!(wait_for_message(&a).await.text(), "just you");
    assert!(b.queue().is_empty());

    server.disconnect_client(a_info.id).await.unwrap();
    eventually("a to see the server close", || {
        let a = a.clone();
        async move { !a.is_connected() }
    })
    .await;
    assert_eq!(server.connection_count().await, 1);
    assert!(b.is_connected());

    match server.send_to(a_info.id, MessageKind::Message, "gone").await {
        Err(TransportError::UnknownConnection(id)) => assert_eq!(id, a_info.id.0),
        other => panic!("unexpected result: {other:?}"),
    }

    server.stop().await.unwrap();
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_client_observes_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let events = EventDispatcher::new();
    let changes = record(&events, EventKind::ClientStatusChanged);
    let client = Client::new(events);
    client.connect("127.0.0.1", port).await.unwrap();

    let (peer, _) = listener.accept().await.unwrap();
    drop(peer);

    eventually("client to notice EOF", || {
        let changes = changes.clone();
        async move { changes.lock().unwrap().len() == 5 }
    })
    .await;
    assert!(!client.is_connected());
    assert_eq!(
        statuses(&changes.lock().unwrap()),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::ServerClosedConnection,
            ConnectionStatus::Disconnecting,
            ConnectionStatus::Disconnected,
        ]
    );

    // Already torn down by the receive loop
    client.disconnect().await.unwrap();
    assert!(matches!(
        client.send_message("late").await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(EventDispatcher::new());
    client.connect("127.0.0.1", port).await.unwrap();
    assert!(matches!(
        client.connect("127.0.0.1", port).await,
        Err(TransportError::AlreadyConnected)
    ));
    assert!(client.is_connected());

    client.disconnect().await.unwrap();
    client.connect("127.0.0.1", port).await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stop_reports_stopping_then_stopped() {
    let events = EventDispatcher::new();
    let changes = record(&events, EventKind::ServerStatusChanged);
    let server = Server::new(events);
    let (addr, handle) = spawn_server(&server).await;
    assert_eq!(server.status(), ServerStatus::Started);

    let a = connected_client(addr.port()).await;
    wait_for_connections(&server, 1).await;

    server.stop().await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(server.status(), ServerStatus::Stopped);
    assert_eq!(server.connection_count().await, 0);
    assert!(server.local_addr().is_none());
    eventually("client to see the server close", || {
        let a = a.clone();
        async move { !a.is_connected() }
    })
    .await;

    // Stopping an idle server emits nothing
    server.stop().await.unwrap();

    let seen: Vec<ServerStatus> = changes
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            NetworkEvent::ServerStatusChanged { status } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ServerStatus::Starting,
            ServerStatus::Started,
            ServerStatus::Stopping,
            ServerStatus::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_stop_racing_start_never_reports_started_late() {
    for _ in 0..20 {
        let events = EventDispatcher::new();
        let changes = record(&events, EventKind::ServerStatusChanged);
        let server = Server::new(events);

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.start(0).await });
        eventually("start to claim the server", || {
            let server = server.clone();
            async move { server.is_running() }
        })
        .await;
        server.stop().await.unwrap();
        handle.await.unwrap().unwrap();

        let seen: Vec<ServerStatus> = changes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                NetworkEvent::ServerStatusChanged { status } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(seen.first(), Some(&ServerStatus::Starting), "{seen:?}");
        assert_eq!(seen.last(), Some(&ServerStatus::Stopped), "{seen:?}");
        let stopping = seen
            .iter()
            .position(|status| *status == ServerStatus::Stopping)
            .expect("Stopping reported");
        assert!(
            !seen[stopping..].contains(&ServerStatus::Started),
            "Started after Stopping: {seen:?}"
        );
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.local_addr().is_none());
    }
}

#[tokio::test]
async fn test_start_while_running_fails() {
    let server = Server::new(EventDispatcher::new());
    let (_addr, _handle) = spawn_server(&server).await;

    assert!(matches!(
        server.start(0).await,
        Err(TransportError::ServerAlreadyRunning)
    ));
    assert!(server.is_running());

    server.stop().await.unwrap();
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_server_restarts_after_stop() {
    let server = Server::new(EventDispatcher::new());
    let (_, first) = spawn_server(&server).await;
    server.stop().await.unwrap();
    first.await.unwrap().unwrap();

    let (addr, second) = spawn_server(&server).await;
    let a = connected_client(addr.port()).await;
    wait_for_connections(&server, 1).await;
    a.disconnect().await.unwrap();

    server.stop().await.unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connections_over_capacity_are_refused() {
    let events = EventDispatcher::new();
    let changes = record(&events, EventKind::ConnectionStatusChanged);
    let server = Server::builder()
        .config(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        })
        .events(events)
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let a = connected_client(addr.port()).await;
    wait_for_connections(&server, 1).await;

    let b = connected_client(addr.port()).await;
    eventually("b to be turned away", || {
        let b = b.clone();
        async move { !b.is_connected() }
    })
    .await;
    eventually("refusal to be reported", || {
        let changes = changes.clone();
        async move { statuses(&changes.lock().unwrap()).contains(&ConnectionStatus::TimedOut) }
    })
    .await;

    assert!(a.is_connected());
    assert_eq!(server.connection_count().await, 1);
    assert_eq!(server.metrics().snapshot().connections_rejected, 1);

    server.stop().await.unwrap();
}
