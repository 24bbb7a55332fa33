//! # Transport Layer
//!
//! TCP client and server speaking the length-prefixed frame protocol.
//!
//! ## Components
//! - **Client**: one outbound connection, inbound messages land in a queue
//! - **Server**: accept loop, connection registry, relay/broadcast
//! - **Connection**: split stream plumbing shared by both sides
//!
//! ## Concurrency
//! Each connection has exactly one receive task owning the read half. Writes
//! from any task go through a per-connection async mutex, so two frames never
//! interleave on the wire. Receive loops end on a cancellation token, which
//! lets `disconnect` and `stop` return without waiting for the peer.

pub mod client;
pub mod connection;
pub mod server;
