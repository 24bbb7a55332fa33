//! Notification records raised by the client and server.
//!
//! Every record is plain data; observers receive it by reference through
//! the [`EventDispatcher`](super::dispatcher::EventDispatcher).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use super::message::NetworkMessage;
use super::status::{ConnectionStatus, ServerStatus};

/// Process-local identifier of a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Public view of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
}

/// Where an inbound payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The server a client is connected to
    Server(SocketAddr),
    /// A connection accepted by the server
    Connection(ConnectionInfo),
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ClientStatusChanged {
        status: ConnectionStatus,
    },
    ServerStatusChanged {
        status: ServerStatus,
    },
    /// The server's view of one accepted connection
    ConnectionStatusChanged {
        connection: ConnectionInfo,
        status: ConnectionStatus,
    },
    MessageReceived {
        origin: Origin,
        message: NetworkMessage,
    },
    StreamReceived {
        origin: Origin,
        data: Bytes,
    },
}

/// Subscription key, one per event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ClientStatusChanged,
    ServerStatusChanged,
    ConnectionStatusChanged,
    MessageReceived,
    StreamReceived,
}

impl NetworkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::ClientStatusChanged { .. } => EventKind::ClientStatusChanged,
            NetworkEvent::ServerStatusChanged { .. } => EventKind::ServerStatusChanged,
            NetworkEvent::ConnectionStatusChanged { .. } => EventKind::ConnectionStatusChanged,
            NetworkEvent::MessageReceived { .. } => EventKind::MessageReceived,
            NetworkEvent::StreamReceived { .. } => EventKind::StreamReceived,
        }
    }
}
