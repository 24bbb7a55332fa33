//! Helpers shared by the networked integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use netframe::protocol::events::{EventKind, NetworkEvent};
use netframe::{EventDispatcher, Server};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns true or `WAIT` elapses.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Start `server` on an ephemeral port and wait until it is listening.
pub async fn spawn_server(server: &Server) -> (SocketAddr, JoinHandle<netframe::Result<()>>) {
    let running = server.clone();
    let handle = tokio::spawn(async move { running.start(0).await });
    eventually("server to bind", || async move { server.local_addr().is_some() }).await;
    let addr = server.local_addr().expect("bound address");
    (addr, handle)
}

/// Records every event of `kind` raised on `events`.
pub fn record(events: &EventDispatcher, kind: EventKind) -> Arc<Mutex<Vec<NetworkEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events
        .subscribe(kind, move |event| sink.lock().unwrap().push(event.clone()))
        .expect("subscribe");
    seen
}
