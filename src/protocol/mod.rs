//! # Message and Event Layer
//!
//! Everything above raw framing that client and server share.
//!
//! ## Components
//! - **Message**: decoded inbound payload with UTF-8 access
//! - **Queue**: non-blocking hand-off to a polling consumer
//! - **Status**: connection and server lifecycle state machines
//! - **Events**: notification records and subscription keys
//! - **Dispatcher**: instance-scoped `raise` / `subscribe` hub

pub mod dispatcher;
pub mod events;
pub mod message;
pub mod queue;
pub mod status;
