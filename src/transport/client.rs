//! # Client
//!
//! One outbound connection to one peer.
//!
//! `connect` opens the socket and starts a single receive task that
//! reassembles frames, pushes text messages into the client's
//! [`NetworkDataQueue`] and raises events for every payload. `send` writes
//! through the connection's serialized writer. `disconnect` cancels the
//! receive task, flushes and closes the write side and drops the socket.
//!
//! ## Status transitions
//! ```text
//! connect:     Connecting -> Connected            (or -> [TimedOut ->] Disconnected)
//! disconnect:  Disconnecting -> Disconnected
//! peer EOF:    ServerClosedConnection -> Disconnecting -> Disconnected
//! ```

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::core::frame::{Frame, MessageKind};
use crate::error::{Result, TransportError};
use crate::protocol::dispatcher::EventDispatcher;
use crate::protocol::events::{NetworkEvent, Origin};
use crate::protocol::message::NetworkMessage;
use crate::protocol::queue::NetworkDataQueue;
use crate::protocol::status::ConnectionStatus;
use crate::transport::connection::{
    next_inbound, note_received, on_unknown_kind, split_stream, FrameReader, FrameWriter, Inbound,
    LoopExit,
};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Cloneable handle to a framed TCP client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: TransportConfig,
    events: EventDispatcher,
    queue: Arc<NetworkDataQueue>,
    metrics: Arc<Metrics>,
    status: watch::Sender<ConnectionStatus>,
    session: Mutex<Option<Session>>,
    next_epoch: AtomicU64,
}

/// State owned while a socket is open.
struct Session {
    epoch: u64,
    writer: Arc<FrameWriter>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Client {
    /// A client with default configuration reporting to `events`.
    pub fn new(events: EventDispatcher) -> Self {
        Self::with_config(ClientConfig::default(), TransportConfig::default(), events)
    }

    pub fn from_network_config(config: &NetworkConfig, events: EventDispatcher) -> Self {
        Self::with_config(config.client.clone(), config.transport.clone(), events)
    }

    pub fn with_config(
        config: ClientConfig,
        transport: TransportConfig,
        events: EventDispatcher,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                events,
                queue: Arc::new(NetworkDataQueue::new()),
                metrics: Arc::new(Metrics::new()),
                status,
                session: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Open a connection to `address:port` and start receiving.
    ///
    /// Fails with `AlreadyConnected` while a connection is open; call
    /// [`disconnect`](Self::disconnect) first to reconnect.
    #[instrument(skip(self))]
    pub async fn connect(&self, address: &str, port: u16) -> Result<()> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        inner.set_status(ConnectionStatus::Connecting);

        let stream = match with_timeout_error(
            async {
                TcpStream::connect((address, port))
                    .await
                    .map_err(TransportError::from)
            },
            inner.config.connect_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                inner.metrics.connection_error();
                if matches!(e, TransportError::Timeout) {
                    inner.set_status(ConnectionStatus::TimedOut);
                }
                inner.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let (local_addr, peer_addr) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Socket lost right after connect");
                inner.set_status(ConnectionStatus::Disconnected);
                return Err(e.into());
            }
        };
        if let Err(e) = stream.set_nodelay(inner.config.nodelay) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }

        let (reader, writer) = split_stream(stream, &inner.transport, inner.metrics.clone());
        let epoch = inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        inner.metrics.connection_established();
        inner.set_status(ConnectionStatus::Connected);
        info!(%local_addr, %peer_addr, "Connected");

        // Spawned while the session lock is held, so a loop that exits
        // immediately still observes the session it belongs to.
        let handle = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            reader,
            cancel.clone(),
            epoch,
            peer_addr,
        ));

        *session = Some(Session {
            epoch,
            writer: Arc::new(writer),
            cancel,
            reader: Some(handle),
            local_addr,
            peer_addr,
        });
        Ok(())
    }

    /// Close the connection. Safe to call when already disconnected,
    /// including after the peer closed the stream.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.inner.session.lock().await.take();
        match session {
            Some(session) => self.inner.close_session(session, true).await,
            None => Ok(()),
        }
    }

    /// Write one framed payload of `kind`.
    ///
    /// Fails fast with `NotConnected` instead of waiting for a connection.
    pub async fn send(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let writer = self
            .inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.writer.clone())
            .ok_or(TransportError::NotConnected)?;

        let result = writer.send(Frame::new(kind, payload)).await;
        if let Err(e) = &result {
            if e.is_disconnect() {
                self.inner.metrics.connection_error();
            }
        }
        result
    }

    /// Send UTF-8 text as a `Message` frame.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.send(MessageKind::Message, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    /// Send opaque bytes as a `Stream` frame.
    pub async fn send_stream(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(MessageKind::Stream, data).await
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Receiver that observes every status transition.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.session.lock().await.as_ref().map(|s| s.local_addr)
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.session.lock().await.as_ref().map(|s| s.peer_addr)
    }

    /// Text messages received from the peer, oldest first.
    pub fn queue(&self) -> &Arc<NetworkDataQueue> {
        &self.inner.queue
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}

impl ClientInner {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Client status changed");
            self.events
                .raise(NetworkEvent::ClientStatusChanged { status });
        }
    }

    async fn close_session(&self, mut session: Session, await_reader: bool) -> Result<()> {
        self.set_status(ConnectionStatus::Disconnecting);
        session.cancel.cancel();
        let closed = session.writer.close().await;

        if let Some(reader) = session.reader.take() {
            if await_reader {
                if let Err(e) = reader.await {
                    error!(error = %e, "Receive task ended abnormally");
                }
            }
        }

        self.metrics.connection_closed();
        self.set_status(ConnectionStatus::Disconnected);
        info!(peer_addr = %session.peer_addr, "Disconnected");
        closed
    }

    /// Teardown requested by the receive loop itself. Does nothing if the
    /// session was already taken by `disconnect` or replaced by a newer one.
    async fn close_from_loop(&self, epoch: u64) {
        let session = {
            let mut guard = self.session.lock().await;
            match guard.as_ref() {
                Some(s) if s.epoch == epoch => guard.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            if let Err(e) = self.close_session(session, false).await {
                debug!(error = %e, "Close after receive loop exit failed");
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

async fn receive_loop(
    inner: Weak<ClientInner>,
    mut reader: FrameReader,
    cancel: CancellationToken,
    epoch: u64,
    peer_addr: SocketAddr,
) {
    let origin = Origin::Server(peer_addr);

    let exit = loop {
        let frame = match next_inbound(&mut reader, &cancel).await {
            Inbound::Frame(frame) => frame,
            Inbound::Exit(exit) => break exit,
        };
        let Some(inner) = inner.upgrade() else {
            break LoopExit::Cancelled;
        };
        note_received(&frame, &inner.metrics);

        match frame.kind {
            MessageKind::Message => {
                let message = NetworkMessage::from(frame);
                inner.queue.enqueue(message.clone());
                inner
                    .events
                    .raise(NetworkEvent::MessageReceived { origin, message });
            }
            MessageKind::Stream => {
                inner.events.raise(NetworkEvent::StreamReceived {
                    origin,
                    data: frame.payload,
                });
            }
            MessageKind::Unknown(kind) => {
                if let Some(exit) = on_unknown_kind(kind, frame.payload.len(), &inner.transport) {
                    break exit;
                }
            }
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };

    match exit {
        // `disconnect` owns the teardown
        LoopExit::Cancelled => return,
        LoopExit::PeerClosed => {
            info!(%peer_addr, "Server closed the connection");
            inner.set_status(ConnectionStatus::ServerClosedConnection);
        }
        LoopExit::ReadError(e) => {
            warn!(%peer_addr, error = %e, "Read failed, closing connection");
            inner.metrics.connection_error();
        }
        LoopExit::ProtocolViolation(e) => {
            error!(%peer_addr, error = %e, "Corrupt stream, closing connection");
            inner.metrics.protocol_error();
        }
    }

    inner.close_from_loop(epoch).await;
}
