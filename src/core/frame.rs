//! Frame header layout and the pure encode/decode helpers.
//!
//! ```text
//! byte 0..3   i32  kind    (1 = Message, 2 = Stream), little-endian
//! byte 4..7   u32  length  (payload byte count), little-endian
//! byte 8..N   payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 8;

/// Discriminates how a frame's payload is interpreted by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text message
    Message,
    /// Opaque binary stream data
    Stream,
    /// An ordinal this build does not understand
    Unknown(u32),
}

impl MessageKind {
    /// Wire ordinal of this kind
    pub fn ordinal(self) -> u32 {
        match self {
            MessageKind::Message => 1,
            MessageKind::Stream => 2,
            MessageKind::Unknown(ordinal) => ordinal,
        }
    }

    /// Map a wire ordinal to a kind; never fails
    pub fn from_ordinal(ordinal: u32) -> Self {
        match ordinal {
            1 => MessageKind::Message,
            2 => MessageKind::Stream,
            other => MessageKind::Unknown(other),
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, MessageKind::Unknown(_))
    }
}

/// The 8-byte header that precedes every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(kind: MessageKind, length: u32) -> Self {
        Self { kind, length }
    }

    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let kind = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            kind: MessageKind::from_ordinal(kind),
            length,
        }
    }

    /// Decode a header from the front of `bytes`, if enough bytes are present.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        let header: &[u8; HEADER_LEN] = bytes.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self::decode(header))
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.kind.ordinal().to_le_bytes());
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn payload_len(self) -> usize {
        self.length as usize
    }
}

/// One complete header + payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A UTF-8 text frame
    pub fn message(text: &str) -> Self {
        Self::new(MessageKind::Message, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// A binary stream frame
    pub fn stream(data: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Stream, data)
    }

    pub fn header(&self) -> Result<FrameHeader> {
        let length = u32::try_from(self.payload.len())
            .map_err(|_| TransportError::OversizedFrame(self.payload.len()))?;
        Ok(FrameHeader::new(self.kind, length))
    }

    /// Total encoded size including the header
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let header = self.header()?;
        dst.reserve(self.encoded_len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode `payload` as a single frame of the given kind.
pub fn encode(kind: MessageKind, payload: &[u8]) -> Result<Bytes> {
    Frame::new(kind, Bytes::copy_from_slice(payload)).to_bytes()
}

/// Decode the header at the front of `bytes`.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> (MessageKind, u32) {
    let header = FrameHeader::decode(bytes);
    (header.kind, header.length)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_header_is_little_endian() {
        let bytes = FrameHeader::new(MessageKind::Stream, 0x0102_0304).to_bytes();
        assert_eq!(bytes, [2, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(MessageKind::Message, b"hi").unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_unknown_ordinal_is_sentinel() {
        let raw = [9, 0, 0, 0, 3, 0, 0, 0];
        assert_eq!(decode_header(&raw), (MessageKind::Unknown(9), 3));
        assert!(!MessageKind::from_ordinal(0).is_known());
    }

    #[test]
    fn test_peek_needs_full_header() {
        assert!(FrameHeader::peek(&[1, 0, 0]).is_none());
        let header = FrameHeader::peek(&[1, 0, 0, 0, 5, 0, 0, 0, 0xAA]).unwrap();
        assert_eq!(header, FrameHeader::new(MessageKind::Message, 5));
    }

    #[test]
    fn test_encoded_len() {
        let frame = Frame::stream(vec![0u8; 100]);
        assert_eq!(frame.encoded_len(), 108);
        assert_eq!(frame.to_bytes().unwrap().len(), 108);
    }
}
