//! # Server
//!
//! Accepts many concurrent connections and keeps a live registry of them.
//!
//! Every accepted socket becomes a [`ConnectionRecord`] in the registry and
//! gets two tasks: a receive task running the same reassembly as the client,
//! and a writer task draining the record's bounded outbound queue. What
//! happens to a decoded text message is decided by the server's
//! [`DispatchPolicy`]; the default relays it to every connection.
//!
//! Relays and broadcasts only enqueue. A peer that stops reading fills its
//! own queue and is dropped; it never holds up another connection's reads
//! or writes.
//!
//! ## Lifecycle
//! ```text
//! start(port):  Starting -> Started -> (accept loop until stopped)
//! stop():       Stopping -> (close every connection) -> Stopped
//! ```
//! Every status change is decided and reported under one transition lock,
//! so a `stop` racing `start` never reports Stopping before Starting, and
//! Started never follows Stopping.
//!
//! ## Registry invariants
//! - Records are inserted by the accept loop and removed by whichever of
//!   the connection's own task, `disconnect_client` or `stop` gets there
//!   first; the loser's cleanup is a no-op.
//! - A record leaves the registry before its task finishes, so a broadcast
//!   snapshot never holds a connection whose cleanup already completed.
//! - A record's task handles are stored before it is published, so anyone
//!   who can look it up can also wait for its tasks.

use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{NetworkConfig, ServerConfig, TransportConfig};
use crate::core::frame::{Frame, MessageKind};
use crate::error::{constants, Result, TransportError};
use crate::protocol::dispatcher::EventDispatcher;
use crate::protocol::events::{ConnectionId, ConnectionInfo, NetworkEvent, Origin};
use crate::protocol::message::NetworkMessage;
use crate::protocol::status::{ConnectionStatus, ServerStatus};
use crate::transport::connection::{
    next_inbound, note_received, on_unknown_kind, split_stream, FrameReader, FrameWriter, Inbound,
    LoopExit,
};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub type MessageCallback = Arc<dyn Fn(ConnectionInfo, NetworkMessage) + Send + Sync + 'static>;

/// What the server does with each decoded text message.
#[derive(Clone, Default)]
pub enum DispatchPolicy {
    /// Rebroadcast to every connection, sender included
    #[default]
    Relay,
    /// Rebroadcast to every connection except the sender
    RelayToOthers,
    /// Hand the message to a callback and rebroadcast nothing
    Callback(MessageCallback),
}

impl DispatchPolicy {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(ConnectionInfo, NetworkMessage) + Send + Sync + 'static,
    {
        DispatchPolicy::Callback(Arc::new(f))
    }
}

impl fmt::Debug for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::Relay => f.write_str("Relay"),
            DispatchPolicy::RelayToOthers => f.write_str("RelayToOthers"),
            DispatchPolicy::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Outcome of a broadcast: which connections accepted the frame into their
/// outbound queue, and which were dropped instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<ConnectionId>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A live accepted connection.
///
/// The registry references the record for broadcast and shutdown. The read
/// half of the socket belongs to the receive task alone; frames for the
/// write half go through `outbound` to the writer task.
pub struct ConnectionRecord {
    info: ConnectionInfo,
    writer: FrameWriter,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionRecord {
    fn new(
        info: ConnectionInfo,
        writer: FrameWriter,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let record = Self {
            info,
            writer,
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        };
        (record, outbound_rx)
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.info.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `frame` for the writer task without waiting.
    fn enqueue(&self, frame: Frame) -> Result<()> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::OutboundFull(self.id().0)),
            Err(TrySendError::Closed(_)) => Err(TransportError::NotConnected),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks().push(handle);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks())
    }
}

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    transport: TransportConfig,
    policy: DispatchPolicy,
    events: Option<EventDispatcher>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn network_config(self, config: &NetworkConfig) -> Self {
        self.config(config.server.clone())
            .transport(config.transport.clone())
    }

    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn events(mut self, events: EventDispatcher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Server {
        let (status, _) = watch::channel(ServerStatus::Idle);
        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                transport: self.transport,
                policy: self.policy,
                events: self.events.unwrap_or_default(),
                metrics: Arc::new(Metrics::new()),
                registry: RwLock::new(HashMap::new()),
                status,
                lifecycle: std::sync::Mutex::new(Lifecycle::default()),
                transition: std::sync::Mutex::new(()),
                local_addr: std::sync::Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

/// Cloneable handle to a framed TCP server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    transport: TransportConfig,
    policy: DispatchPolicy,
    events: EventDispatcher,
    metrics: Arc<Metrics>,
    registry: RwLock<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    status: watch::Sender<ServerStatus>,
    lifecycle: std::sync::Mutex<Lifecycle>,
    /// Held while a lifecycle decision and its status event go out together
    transition: std::sync::Mutex<()>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    next_id: AtomicU64,
}

/// Run state shared by `start` and `stop`, changed under one lock so the
/// two can race without losing a shutdown request.
#[derive(Default)]
struct Lifecycle {
    running: bool,
    shutdown: CancellationToken,
    /// Resolves once the accept loop has dropped its listener
    accept_done: Option<oneshot::Receiver<()>>,
}

impl Server {
    /// A relay server with default configuration reporting to `events`.
    pub fn new(events: EventDispatcher) -> Self {
        Self::builder().events(events).build()
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind `port` (0 for an ephemeral port) and accept connections until
    /// [`stop`](Self::stop) is called.
    #[instrument(skip(self))]
    pub async fn start(&self, port: u16) -> Result<()> {
        let inner = &self.inner;
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        {
            let _transition = inner.transition();
            {
                let mut lifecycle = inner.lifecycle();
                if lifecycle.running {
                    return Err(TransportError::ServerAlreadyRunning);
                }
                lifecycle.running = true;
                lifecycle.shutdown = shutdown.clone();
                lifecycle.accept_done = Some(done_rx);
            }
            inner.set_status(ServerStatus::Starting);
        }

        let bound = match TcpListener::bind((inner.config.bind_address.as_str(), port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(error = %e, "Failed to bind listener");
                let _transition = inner.transition();
                inner.lifecycle().running = false;
                inner.set_status(ServerStatus::Stopped);
                return Err(e.into());
            }
        };

        {
            // `stop` cancels and reports Stopping under the same lock, so
            // Started can never follow Stopping
            let _transition = inner.transition();
            if !shutdown.is_cancelled() {
                inner.set_status(ServerStatus::Started);
                info!(%local_addr, "Listening");
            }
        }
        if let Ok(mut slot) = inner.local_addr.lock() {
            *slot = Some(local_addr);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.admit(stream, remote, &shutdown).await,
                    Err(e) => {
                        warn!(error = %e, "Error accepting connection");
                        inner.metrics.connection_error();
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        drop(done_tx);
        info!(%local_addr, "Accept loop stopped");
        Ok(())
    }

    /// Stop accepting, close every connection and clear the registry.
    ///
    /// Safe while `start` is blocked in accept, and a no-op when the server
    /// is not running.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let accept_done = {
            let _transition = inner.transition();
            let accept_done = {
                let mut lifecycle = inner.lifecycle();
                if !lifecycle.running {
                    return Ok(());
                }
                lifecycle.running = false;
                lifecycle.shutdown.cancel();
                lifecycle.accept_done.take()
            };
            inner.set_status(ServerStatus::Stopping);
            accept_done
        };

        if let Some(done) = accept_done {
            if tokio::time::timeout(inner.config.shutdown_timeout, done)
                .await
                .is_err()
            {
                warn!("Accept loop did not exit within the shutdown timeout");
            }
        }

        let records: Vec<Arc<ConnectionRecord>> =
            inner.registry.read().await.values().cloned().collect();
        info!(connections = records.len(), "Closing connections");
        join_all(
            records
                .into_iter()
                .map(|record| inner.disconnect_record(record, ConnectionStatus::Disconnected)),
        )
        .await;
        inner.registry.write().await.clear();

        if let Ok(mut slot) = inner.local_addr.lock() {
            *slot = None;
        }
        inner.metrics.log_metrics("server");
        inner.set_status(ServerStatus::Stopped);
        Ok(())
    }

    /// Send `text` as a `Message` frame to every connection.
    pub async fn broadcast_message(&self, text: &str) -> BroadcastReport {
        self.inner.broadcast(Frame::message(text), None).await
    }

    /// Send a frame of `kind` to every connection.
    pub async fn broadcast(&self, kind: MessageKind, payload: impl Into<Bytes>) -> BroadcastReport {
        self.inner.broadcast(Frame::new(kind, payload), None).await
    }

    /// Send a frame of `kind` to every connection except `excluded`.
    pub async fn broadcast_except(
        &self,
        excluded: ConnectionId,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> BroadcastReport {
        self.inner
            .broadcast(Frame::new(kind, payload), Some(excluded))
            .await
    }

    /// Queue a frame of `kind` for one connection.
    ///
    /// Fails with `OutboundFull` when the peer has fallen too far behind;
    /// that connection is then dropped.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let record = self
            .inner
            .lookup(id)
            .await
            .ok_or(TransportError::UnknownConnection(id.0))?;
        self.inner.queue_frame(&record, Frame::new(kind, payload))
    }

    /// Close one connection and wait for its tasks to finish.
    pub async fn disconnect_client(&self, id: ConnectionId) -> Result<()> {
        let record = self
            .inner
            .lookup(id)
            .await
            .ok_or(TransportError::UnknownConnection(id.0))?;
        self.inner
            .disconnect_record(record, ConnectionStatus::Disconnected)
            .await;
        Ok(())
    }

    /// Currently registered connections, ordered by id.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .registry
            .read()
            .await
            .values()
            .map(|record| record.info())
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Bound address while listening; `None` before `start` or after `stop`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.lock().ok().and_then(|slot| *slot)
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().running
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.inner.policy
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    async fn admit(&self, stream: TcpStream, remote: SocketAddr, shutdown: &CancellationToken) {
        let inner = &self.inner;
        let id = ConnectionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let info = ConnectionInfo { id, remote };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%id, error = %e, "Could not set TCP_NODELAY");
        }
        let (reader, writer) = split_stream(stream, &inner.transport, inner.metrics.clone());
        let (record, outbound) =
            ConnectionRecord::new(info, writer, inner.config.outbound_queue_capacity);
        let record = Arc::new(record);

        // Both tasks exist before the record is published; the receive task
        // waits for `admitted` so a refused connection never reads
        let (admitted, admission) = oneshot::channel::<()>();
        record.add_task(tokio::spawn(write_loop(
            record.clone(),
            outbound,
            inner.metrics.clone(),
            inner.config.write_timeout,
        )));
        let task_inner = inner.clone();
        let task_record = record.clone();
        record.add_task(tokio::spawn(async move {
            if admission.await.is_ok() {
                task_inner.handle_connection(task_record, reader).await;
            }
        }));

        inner.connection_status(info, ConnectionStatus::Connecting);

        if let Err(e) = inner.register(record.clone(), shutdown).await {
            warn!(%id, %remote, error = %e, "Connection refused");
            inner.metrics.connection_rejected();
            record.closed.store(true, Ordering::Release);
            record.cancel.cancel();
            inner.close_writer(&record).await;
            inner.connection_status(info, ConnectionStatus::TimedOut);
            return;
        }

        inner.metrics.connection_established();
        info!(%id, %remote, "Connection accepted");
        inner.connection_status(info, ConnectionStatus::Connected);
        let _ = admitted.send(());
    }
}

impl ServerInner {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self) -> std::sync::MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ServerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Server status changed");
            self.events
                .raise(NetworkEvent::ServerStatusChanged { status });
        }
    }

    fn connection_status(&self, connection: ConnectionInfo, status: ConnectionStatus) {
        self.events
            .raise(NetworkEvent::ConnectionStatusChanged { connection, status });
    }

    async fn register(
        &self,
        record: Arc<ConnectionRecord>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut registry = self.registry.write().await;
        // Checked under the lock so `stop` cannot miss a late insertion
        if shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        if registry.len() >= self.config.max_connections {
            return Err(TransportError::ConnectionRefused(
                constants::ERR_REGISTRY_FULL.to_string(),
            ));
        }
        if registry.contains_key(&record.id()) {
            return Err(TransportError::ConnectionRefused(
                constants::ERR_DUPLICATE_CONNECTION.to_string(),
            ));
        }
        registry.insert(record.id(), record);
        Ok(())
    }

    async fn lookup(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.registry.read().await.get(&id).cloned()
    }

    async fn handle_connection(self: Arc<Self>, record: Arc<ConnectionRecord>, mut reader: FrameReader) {
        let info = record.info();
        let origin = Origin::Connection(info);

        let exit = loop {
            let frame = match next_inbound(&mut reader, &record.cancel).await {
                Inbound::Frame(frame) => frame,
                Inbound::Exit(exit) => break exit,
            };
            note_received(&frame, &self.metrics);

            match frame.kind {
                MessageKind::Message => {
                    let message = NetworkMessage::from(frame);
                    self.events.raise(NetworkEvent::MessageReceived {
                        origin,
                        message: message.clone(),
                    });
                    // Only enqueues; never waits on another peer's socket
                    self.dispatch(info, message).await;
                }
                MessageKind::Stream => {
                    self.events.raise(NetworkEvent::StreamReceived {
                        origin,
                        data: frame.payload,
                    });
                }
                MessageKind::Unknown(kind) => {
                    if let Some(exit) = on_unknown_kind(kind, frame.payload.len(), &self.transport) {
                        break exit;
                    }
                }
            }
        };

        match &exit {
            LoopExit::Cancelled => debug!(id = %info.id, "Connection task cancelled"),
            LoopExit::PeerClosed => info!(id = %info.id, remote = %info.remote, "Peer closed the connection"),
            LoopExit::ReadError(e) => {
                warn!(id = %info.id, error = %e, "Read failed, closing connection");
                self.metrics.connection_error();
            }
            LoopExit::ProtocolViolation(e) => {
                error!(id = %info.id, error = %e, "Corrupt stream, closing connection");
                self.metrics.protocol_error();
            }
        }

        self.release(&record, ConnectionStatus::Disconnected).await;
        // Dropping `reader` here closes the read half
    }

    async fn dispatch(&self, from: ConnectionInfo, message: NetworkMessage) {
        match &self.policy {
            DispatchPolicy::Relay => {
                let frame = Frame::new(MessageKind::Message, message.into_raw());
                self.broadcast(frame, None).await;
            }
            DispatchPolicy::RelayToOthers => {
                let frame = Frame::new(MessageKind::Message, message.into_raw());
                self.broadcast(frame, Some(from.id)).await;
            }
            DispatchPolicy::Callback(callback) => callback(from, message),
        }
    }

    async fn broadcast(&self, frame: Frame, excluded: Option<ConnectionId>) -> BroadcastReport {
        let targets: Vec<Arc<ConnectionRecord>> = self
            .registry
            .read()
            .await
            .values()
            .filter(|record| Some(record.id()) != excluded)
            .cloned()
            .collect();

        let mut report = BroadcastReport::default();
        for record in targets {
            match self.queue_frame(&record, frame.clone()) {
                Ok(()) => report.delivered.push(record.id()),
                Err(_) => report.failed.push(record.id()),
            }
        }
        report.delivered.sort();
        report.failed.sort();
        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Hand one frame to a connection's writer task. A peer whose queue is
    /// full or gone is cancelled so its receive task tears it down.
    fn queue_frame(&self, record: &ConnectionRecord, frame: Frame) -> Result<()> {
        let result = record.enqueue(frame);
        if let Err(e) = &result {
            warn!(id = %record.id(), error = %e, "Peer not keeping up, dropping connection");
            self.metrics.connection_error();
            record.cancel.cancel();
        }
        result
    }

    /// Flush and shut the write half, giving up after `write_timeout` on a
    /// peer that is not reading.
    async fn close_writer(&self, record: &ConnectionRecord) {
        match tokio::time::timeout(self.config.write_timeout, record.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(id = %record.id(), error = %e, "Close failed"),
            Err(_) => debug!(id = %record.id(), "Close timed out, dropping socket"),
        }
    }

    /// Remove `record` from the registry, close its socket and report
    /// `status`. Only the first caller for a record does anything.
    async fn release(&self, record: &ConnectionRecord, status: ConnectionStatus) -> bool {
        if record.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.registry.write().await.remove(&record.id());
        self.connection_status(record.info(), ConnectionStatus::Disconnecting);
        record.cancel.cancel();
        self.close_writer(record).await;
        self.metrics.connection_closed();
        self.connection_status(record.info(), status);
        info!(id = %record.id(), remote = %record.remote(), "Connection closed");
        true
    }

    /// Release `record` from outside its tasks, then wait for them.
    async fn disconnect_record(&self, record: Arc<ConnectionRecord>, status: ConnectionStatus) {
        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.release(&record, status))
            .await
            .is_err()
        {
            warn!(id = %record.id(), "Close timed out");
        }

        for task in record.take_tasks() {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(id = %record.id(), error = %e, "Connection task ended abnormally"),
                Err(_) => warn!(id = %record.id(), "Connection task did not exit in time"),
            }
        }
    }
}

/// Drain `outbound` onto the socket, one frame at a time in queue order.
///
/// A write that fails or exceeds `write_timeout` cancels the connection.
async fn write_loop(
    record: Arc<ConnectionRecord>,
    mut outbound: mpsc::Receiver<Frame>,
    metrics: Arc<Metrics>,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = record.cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = record.cancel.cancelled() => break,
            written = with_timeout_error(record.writer.send(frame), write_timeout) => written,
        };
        if let Err(e) = written {
            warn!(id = %record.id(), error = %e, "Write failed, dropping connection");
            metrics.connection_error();
            record.cancel.cancel();
            break;
        }
    }
    trace!(id = %record.id(), "Writer task finished");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_policy_debug_hides_callback() {
        assert_eq!(format!("{:?}", DispatchPolicy::default()), "Relay");
        let policy = DispatchPolicy::callback(|_, _| {});
        assert_eq!(format!("{policy:?}"), "Callback(..)");
    }

    #[test]
    fn test_report_completeness() {
        let mut report = BroadcastReport::default();
        assert!(report.is_complete());
        report.failed.push(ConnectionId(3));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let server = Server::new(EventDispatcher::new());
        server.stop().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Idle);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_reported() {
        let server = Server::new(EventDispatcher::new());
        assert!(matches!(
            server.disconnect_client(ConnectionId(42)).await,
            Err(TransportError::UnknownConnection(42))
        ));
        assert!(matches!(
            server.send_to(ConnectionId(7), MessageKind::Stream, vec![1u8]).await,
            Err(TransportError::UnknownConnection(7))
        ));
    }

    async fn loopback_record(
        id: u64,
        queue_capacity: usize,
    ) -> (Arc<ConnectionRecord>, mpsc::Receiver<Frame>, TcpStream, FrameReader) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, remote) = accepted.unwrap();
        let (reader, writer) =
            split_stream(stream, &TransportConfig::default(), Arc::new(Metrics::new()));
        let info = ConnectionInfo { id: ConnectionId(id), remote };
        let (record, outbound) = ConnectionRecord::new(info, writer, queue_capacity);
        (Arc::new(record), outbound, peer.unwrap(), reader)
    }

    #[tokio::test]
    async fn test_broadcast_fails_only_peers_that_cannot_queue() {
        let server = Server::new(EventDispatcher::new());
        let (healthy, mut healthy_rx, _healthy_peer, _healthy_reader) = loopback_record(1, 4).await;
        let (backlogged, _backlogged_rx, _backlogged_peer, _backlogged_reader) =
            loopback_record(2, 1).await;
        let (gone, gone_rx, _gone_peer, _gone_reader) = loopback_record(3, 4).await;

        backlogged.enqueue(Frame::message("backlog")).unwrap();
        drop(gone_rx);
        {
            let mut registry = server.inner.registry.write().await;
            for record in [&healthy, &backlogged, &gone] {
                registry.insert(record.id(), record.clone());
            }
        }

        let report = server.broadcast_message("hello").await;
        assert_eq!(report.delivered, vec![ConnectionId(1)]);
        assert_eq!(report.failed, vec![ConnectionId(2), ConnectionId(3)]);
        assert!(!report.is_complete());

        assert_eq!(&healthy_rx.try_recv().unwrap().payload[..], b"hello");
        assert!(!healthy.cancel.is_cancelled());
        assert!(backlogged.cancel.is_cancelled());
        assert!(gone.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_to_backlogged_peer_fails_without_waiting() {
        let server = Server::new(EventDispatcher::new());
        let (record, _outbound, _peer, _reader) = loopback_record(5, 1).await;
        server
            .inner
            .registry
            .write()
            .await
            .insert(record.id(), record.clone());

        server
            .send_to(ConnectionId(5), MessageKind::Stream, vec![1u8])
            .await
            .unwrap();
        assert!(matches!(
            server.send_to(ConnectionId(5), MessageKind::Stream, vec![2u8]).await,
            Err(TransportError::OutboundFull(5))
        ));
        assert!(record.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_task_handles_survive_poisoned_lock() {
        let (record, _outbound, _peer, _reader) = loopback_record(9, 1).await;
        let poisoner = record.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tasks.lock().unwrap();
            panic!("poisoning the task list");
        })
        .join();
        assert!(record.tasks.is_poisoned());

        record.add_task(tokio::spawn(async {}));
        assert_eq!(record.take_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_registered_connection_already_owns_its_tasks() {
        let server = Server::new(EventDispatcher::new());
        let runner = server.clone();
        let accept = tokio::spawn(async move { runner.start(0).await });
        while server.local_addr().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let _peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let record = loop {
            let first = server.inner.registry.read().await.values().next().cloned();
            match first {
                Some(record) => break record,
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };
        // Writer and receive task are both stored before registration
        assert_eq!(record.tasks().len(), 2);

        server.disconnect_client(record.id()).await.unwrap();
        assert!(record.tasks().is_empty());
        assert_eq!(server.connection_count().await, 0);

        server.stop().await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Server::new(EventDispatcher::new());
        assert!(server.start(port).await.is_err());
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(!server.is_running());
    }
}
