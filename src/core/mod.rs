//! # Core Framing Components
//!
//! Low-level frame layout and the stream codec.
//!
//! ## Components
//! - **Frame**: fixed 8-byte header plus payload, pure encode/decode
//! - **Codec**: Tokio codec that reassembles frames from a byte stream
//!
//! ## Wire Format
//! ```text
//! [Kind(4)] [Length(4)] [Payload(N)]      little-endian, no padding
//! ```
//!
//! ## Safety Limits
//! - Maximum payload size is configurable (16MB default) and checked before
//!   any payload bytes are buffered

pub mod codec;
pub mod frame;
