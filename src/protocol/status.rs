use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single connection, seen from the client or from the
/// server's per-connection view.
///
/// `Connecting → Connected → Disconnecting → Disconnected` is the normal
/// path. `ServerClosedConnection` and `TimedOut` are alternate outcomes
/// raised by the receive loop or the accept path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// The peer closed its end of the stream
    ServerClosedConnection,
    /// Registry insertion was refused or the connect attempt expired
    TimedOut,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    /// No live socket is associated with this status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected
                | ConnectionStatus::ServerClosedConnection
                | ConnectionStatus::TimedOut
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::ServerClosedConnection => "server closed connection",
            ConnectionStatus::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Constructed, never started
    Idle,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl ServerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Started)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Idle => "idle",
            ServerStatus::Starting => "starting",
            ServerStatus::Started => "started",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
