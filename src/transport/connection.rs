//! Per-connection plumbing shared by the client and the server.
//!
//! A TCP stream is split in two. The read half goes to exactly one receive
//! task wrapped in a [`FrameReader`]; the write half sits behind the async
//! mutex in [`FrameWriter`], the single writer critical section for that
//! connection.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame::Frame;
use crate::error::{Result, TransportError};
use crate::utils::metrics::Metrics;

pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// Split `stream` into a framed reader and a serialized framed writer.
pub fn split_stream(
    stream: TcpStream,
    transport: &TransportConfig,
    metrics: Arc<Metrics>,
) -> (FrameReader, FrameWriter) {
    let codec = FrameCodec::new(transport.max_payload_size);
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::with_capacity(read_half, codec.clone(), transport.read_buffer_capacity);
    let writer = FrameWriter::new(FramedWrite::new(write_half, codec), metrics);
    (reader, writer)
}

/// Write side of one connection. Concurrent `send` calls are serialized so
/// a frame's header and payload are never interleaved with another frame.
pub struct FrameWriter {
    sink: Mutex<Option<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
    metrics: Arc<Metrics>,
}

impl FrameWriter {
    pub fn new(sink: FramedWrite<OwnedWriteHalf, FrameCodec>, metrics: Arc<Metrics>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            metrics,
        }
    }

    /// Write one complete frame and flush it.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let len = frame.encoded_len() as u64;
        sink.send(frame).await?;
        self.metrics.message_sent(len);
        Ok(())
    }

    /// Flush pending bytes and shut down the write half. Later sends fail
    /// with `NotConnected`; closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return Ok(());
        };
        match sink.close().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_disconnect() => {
                trace!(error = %e, "Write half already gone at close");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// Zero-byte read: the peer closed its end
    PeerClosed,
    /// Local disconnect or shutdown
    Cancelled,
    /// Socket read failed
    ReadError(TransportError),
    /// The stream is corrupt and cannot be resynchronized
    ProtocolViolation(TransportError),
}

pub enum Inbound {
    Frame(Frame),
    Exit(LoopExit),
}

/// Wait for the next reassembled frame, or for the loop to end.
///
/// Cancellation wins over pending data so a disconnect never waits for
/// bytes that may never arrive.
pub async fn next_inbound(reader: &mut FrameReader, cancel: &CancellationToken) -> Inbound {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Inbound::Exit(LoopExit::Cancelled),
        next = reader.next() => match next {
            None => Inbound::Exit(LoopExit::PeerClosed),
            Some(Ok(frame)) => Inbound::Frame(frame),
            // EOF in the middle of a frame
            Some(Err(TransportError::ConnectionClosed)) => Inbound::Exit(LoopExit::PeerClosed),
            Some(Err(e @ TransportError::Io(_))) => Inbound::Exit(LoopExit::ReadError(e)),
            Some(Err(e)) => Inbound::Exit(LoopExit::ProtocolViolation(e)),
        },
    }
}

/// Decide what to do with a frame whose kind ordinal is undefined.
///
/// Returns the exit to take when the stream should be closed.
pub fn on_unknown_kind(kind: u32, len: usize, transport: &TransportConfig) -> Option<LoopExit> {
    if transport.close_on_unknown_kind {
        Some(LoopExit::ProtocolViolation(TransportError::UnknownKind(kind)))
    } else {
        warn!(kind, len, "Skipping frame with unknown kind");
        None
    }
}

/// Record an inbound frame in `metrics` and log it.
pub fn note_received(frame: &Frame, metrics: &Metrics) {
    metrics.message_received(frame.encoded_len() as u64);
    debug!(kind = ?frame.kind, len = frame.payload.len(), "Frame received");
}
