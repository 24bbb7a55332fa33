//! # netframe
//!
//! Length-prefixed message framing over TCP, with an event-driven client and
//! a relaying server.
//!
//! Every frame on the wire is an 8-byte header followed by the payload:
//!
//! ```text
//! [Kind(4, LE)] [Length(4, LE)] [Payload(Length)]
//! ```
//!
//! Kind `1` carries UTF-8 text (`Message`), kind `2` carries opaque bytes
//! (`Stream`). Frames are reassembled across arbitrary TCP segmentation.
//!
//! ## Example
//! ```rust,no_run
//! use netframe::{Client, EventDispatcher, EventKind, NetworkEvent, Server};
//!
//! # async fn run() -> netframe::Result<()> {
//! let events = EventDispatcher::new();
//! events.subscribe(EventKind::MessageReceived, |event| {
//!     if let NetworkEvent::MessageReceived { message, .. } = event {
//!         println!("got {}", message.text());
//!     }
//! })?;
//!
//! let server = Server::new(events.clone());
//! let running = server.clone();
//! tokio::spawn(async move { running.start(9000).await });
//!
//! let client = Client::new(events);
//! client.connect("127.0.0.1", 9000).await?;
//! client.send_message("hello").await?;
//! client.disconnect().await?;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::codec::FrameCodec;
pub use crate::core::frame::{Frame, FrameHeader, MessageKind, HEADER_LEN};
pub use config::NetworkConfig;
pub use error::{Result, TransportError};
pub use protocol::dispatcher::{EventDispatcher, SubscriptionId};
pub use protocol::events::{ConnectionId, ConnectionInfo, EventKind, NetworkEvent, Origin};
pub use protocol::message::NetworkMessage;
pub use protocol::queue::NetworkDataQueue;
pub use protocol::status::{ConnectionStatus, ServerStatus};
pub use transport::client::Client;
pub use transport::server::{BroadcastReport, DispatchPolicy, Server, ServerBuilder};
