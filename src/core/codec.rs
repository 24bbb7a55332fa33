//! Stream reassembly for length-prefixed frames.
//!
//! `FrameCodec` recovers frame boundaries from a byte stream that has none.
//! `FramedRead` owns the receive buffer and appends every socket read to it;
//! `decode` is then called until it returns `None`, which is the "loop while
//! progress is possible" step. Consumed bytes are split off the front of the
//! `BytesMut`, so the buffer compacts itself without reallocating per read.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::frame::{Frame, FrameHeader, HEADER_LEN};
use crate::error::{Result, TransportError};

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
    /// Header already consumed whose payload has not fully arrived.
    /// `None` means the next bytes start a new header.
    pending: Option<FrameHeader>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            pending: None,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Payload bytes still awaited for the current frame; zero while waiting for a header.
    pub fn expected_len(&self) -> usize {
        self.pending.map(FrameHeader::payload_len).unwrap_or(0)
    }

    pub fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let Some(header) = FrameHeader::peek(&src[..]) else {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                };

                let len = header.payload_len();
                if len > self.max_payload_size {
                    return Err(TransportError::OversizedFrame(len));
                }

                src.advance(HEADER_LEN);
                trace!(kind = ?header.kind, len, "Frame header decoded");
                self.pending = Some(header);
                header
            }
        };

        let len = header.payload_len();
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            kind: header.kind,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.pending.is_none() => Ok(None),
            // The peer closed mid-frame; what remains can never complete
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload_size {
            return Err(TransportError::OversizedFrame(frame.payload.len()));
        }
        frame.encode_into(dst)
    }
}
