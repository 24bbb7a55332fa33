//! # Error Types
//!
//! Error handling for the framed transport.
//!
//! This module defines every error variant the client, server and codec can
//! surface, from low-level socket failures to framing violations.
//!
//! ## Error Categories
//! - **I/O Errors**: connect, read and write failures on the socket
//! - **Protocol Errors**: oversized frames, unknown message kinds, bad headers
//! - **Lifecycle Errors**: sending while disconnected, connecting twice
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Transient I/O failures inside receive loops are logged and turned into
//! status events instead of being returned; only explicit calls such as
//! `connect` or `send` hand an error back to the caller.
//!
//! ## Example Usage
//! ```rust,no_run
//! use netframe::error::{Result, TransportError};
//! use netframe::transport::client::Client;
//! use tracing::error;
//!
//! async fn say_hello(client: &Client) -> Result<()> {
//!     match client.send_message("hello").await {
//!         Err(TransportError::NotConnected) => {
//!             error!("client is not connected");
//!             Ok(())
//!         }
//!         other => other,
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on event dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on event dispatcher";

    /// Connection errors
    pub const ERR_REGISTRY_FULL: &str = "Connection registry is at capacity";
    pub const ERR_DUPLICATE_CONNECTION: &str = "Connection id already registered";

    /// Logging errors
    pub const ERR_SUBSCRIBER_INSTALLED: &str = "A global tracing subscriber is already installed";
}

/// Primary error type for all transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected; disconnect before connecting again")]
    AlreadyConnected,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unknown message kind: {0}")]
    UnknownKind(u32),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection refused by registry: {0}")]
    ConnectionRefused(String),

    #[error("Server is already running")]
    ServerAlreadyRunning,

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("Outbound queue full for connection {0}")]
    OutboundFull(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Logging error: {0}")]
    LoggingError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl TransportError {
    /// Whether this error means the peer or the socket went away, as opposed
    /// to a framing or usage problem.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionClosed | TransportError::NotConnected => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
