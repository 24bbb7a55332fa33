use bytes::Bytes;
use std::borrow::Cow;

use crate::core::frame::{Frame, MessageKind};

/// A fully decoded inbound payload handed to the application.
///
/// Produced by a receive loop and moved into the [`NetworkDataQueue`]
/// or an event; the consumer owns it once dequeued.
///
/// [`NetworkDataQueue`]: crate::protocol::queue::NetworkDataQueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    kind: MessageKind,
    raw: Bytes,
}

impl NetworkMessage {
    pub fn new(kind: MessageKind, raw: Bytes) -> Self {
        Self { kind, raw }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Original payload bytes
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    /// Payload decoded as UTF-8; invalid sequences are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Payload decoded as UTF-8, or `None` if it is not valid text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl From<Frame> for NetworkMessage {
    fn from(frame: Frame) -> Self {
        Self::new(frame.kind, frame.payload)
    }
}
