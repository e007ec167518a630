//! Egress serialization.
//!
//! Converts structured results (policy events, suppression summaries,
//! compliance results, capture data, metric samples) into framed wire
//! messages and enqueues them on a bounded priority queue consumed by the
//! transport. The queue never blocks the producer: a full lane drops the
//! frame and counts it.
//!
//! Frame layout:
//!
//! ```text
//! +---------+---------+---------+----------+------------+------------+
//! | version | type    | flags   | reserved | length (4) | ts_ns (8)  |
//! | (1)     | (1)     | (1)     | (1)      | BE         | BE         |
//! +---------+---------+---------+----------+------------+------------+
//! | body (protobuf, optionally gzip)                                 |
//! +------------------------------------------------------------------+
//! ```
//!
//! Compression is negotiated once at startup (GZIP or none) and applies
//! to every body.

pub mod wire;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use prost::Message;
use thiserror::Error;
use tracing::debug;

use crate::config::CompressionConfig;

/// Protocol version stamped in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 16;

/// Maximum frame size accepted by the decoder.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header flag bit: body is gzip-compressed.
const FLAG_GZIP: u8 = 0x01;

/// Outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Aggregated metric sample.
    Metrics = 1,
    /// Policy event batch.
    PolicyEvents = 2,
    /// Throttled policy event summary.
    ThrottledPolicyEvents = 3,
    /// Compliance results batch.
    CompResults = 4,
    /// Capture file chunk.
    CaptureData = 5,
}

impl MessageType {
    /// All message types.
    pub const ALL: [Self; 5] = [
        Self::Metrics,
        Self::PolicyEvents,
        Self::ThrottledPolicyEvents,
        Self::CompResults,
        Self::CaptureData,
    ];

    /// Fixed transport priority for this message type.
    #[must_use]
    pub const fn priority(self) -> Priority {
        match self {
            Self::Metrics | Self::PolicyEvents => Priority::Medium,
            Self::ThrottledPolicyEvents | Self::CompResults | Self::CaptureData => Priority::Low,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == tag)
    }

    const fn index(self) -> usize {
        match self {
            Self::Metrics => 0,
            Self::PolicyEvents => 1,
            Self::ThrottledPolicyEvents => 2,
            Self::CompResults => 3,
            Self::CaptureData => 4,
        }
    }
}

/// Transport queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Drained first.
    High,
    /// Normal traffic.
    Medium,
    /// Bulk/deferrable traffic.
    Low,
}

/// Errors from the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame larger than [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Offending size.
        size: usize,
        /// Cap exceeded.
        max: usize,
    },

    /// Header or body ended early.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Unknown message type tag.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Body failed to decompress.
    #[error("could not decompress frame body: {0}")]
    Decompress(#[from] std::io::Error),
}

/// A serialized frame ready for the transport.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message type.
    pub msg_type: MessageType,
    /// Whether the body is gzip-compressed.
    pub compressed: bool,
    /// Emission timestamp in nanoseconds.
    pub ts_ns: u64,
    /// Message body (already compressed when `compressed`).
    pub body: Bytes,
}

impl Frame {
    /// Encodes the frame, header plus body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.body.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(if self.compressed { FLAG_GZIP } else { 0 });
        buf.put_u8(0);
        buf.put_u32(u32::try_from(self.body.len()).expect("body bounded by MAX_FRAME_SIZE"));
        buf.put_u64(self.ts_ns);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decodes one frame and returns it with the body decompressed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for truncation, version or type
    /// mismatches, oversized bodies, or a body that fails to inflate.
    pub fn decode(mut src: Bytes) -> Result<Self, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_LEN,
                have: src.len(),
            });
        }
        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::BadVersion(version));
        }
        let type_tag = src.get_u8();
        let msg_type = MessageType::from_tag(type_tag).ok_or(FrameError::UnknownType(type_tag))?;
        let flags = src.get_u8();
        let _reserved = src.get_u8();
        let len = src.get_u32() as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let ts_ns = src.get_u64();
        if src.len() < len {
            return Err(FrameError::Truncated {
                need: len,
                have: src.len(),
            });
        }
        let raw = src.split_to(len);

        let body = if flags & FLAG_GZIP != 0 {
            let mut inflated = Vec::new();
            GzDecoder::new(raw.as_ref()).read_to_end(&mut inflated)?;
            Bytes::from(inflated)
        } else {
            raw
        };

        Ok(Self {
            msg_type,
            compressed: false,
            ts_ns,
            body,
        })
    }
}

/// The transport-facing outbound queue port.
///
/// `put` must never block; `false` means the frame was dropped and the
/// caller counts it.
pub trait Sink: Send + Sync {
    /// Offers a frame at the given priority.
    fn put(&self, frame: Frame, priority: Priority) -> bool;
}

/// Converts structured results into frames and feeds the sink.
pub struct EgressHandler {
    sink: std::sync::Arc<dyn Sink>,
    compression: CompressionConfig,
    dropped: [AtomicU64; MessageType::ALL.len()],
}

impl EgressHandler {
    /// Creates a handler with the negotiated compression.
    #[must_use]
    pub fn new(sink: std::sync::Arc<dyn Sink>, compression: CompressionConfig) -> Self {
        Self {
            sink,
            compression,
            dropped: Default::default(),
        }
    }

    /// Frames dropped so far for `msg_type` because the queue was full.
    #[must_use]
    pub fn dropped(&self, msg_type: MessageType) -> u64 {
        self.dropped[msg_type.index()].load(Ordering::Relaxed)
    }

    /// Enqueues a policy event batch.
    pub fn policy_events_ready(&self, ts_ns: u64, events: &wire::PolicyEventsMsg) {
        debug!(ne = events.events.len(), "serializing policy events");
        self.transmit(MessageType::PolicyEvents, ts_ns, events);
    }

    /// Enqueues a throttled-events summary.
    pub fn throttled_events_ready(&self, ts_ns: u64, summary: &wire::ThrottledPolicyEventsMsg) {
        debug!(
            nte = summary.entries.len(),
            tcount = summary.total_count,
            "serializing throttled policy events"
        );
        self.transmit(MessageType::ThrottledPolicyEvents, ts_ns, summary);
    }

    /// Enqueues a compliance results batch.
    pub fn comp_results_ready(&self, ts_ns: u64, results: &wire::CompResultsMsg) {
        debug!(ne = results.results.len(), "serializing compliance results");
        self.transmit(MessageType::CompResults, ts_ns, results);
    }

    /// Enqueues one capture file chunk.
    pub fn capture_data_ready(&self, ts_ns: u64, chunk: &wire::CaptureDataMsg) {
        self.transmit(MessageType::CaptureData, ts_ns, chunk);
    }

    /// Enqueues a pre-serialized metric sample.
    ///
    /// The aggregation pipeline owns the sample's encoding; the handler
    /// only frames and (optionally) compresses it.
    pub fn metrics_sample_ready(&self, ts_ns: u64, sample: Bytes) {
        self.put(MessageType::Metrics, ts_ns, sample);
    }

    fn transmit<M: Message>(&self, msg_type: MessageType, ts_ns: u64, msg: &M) {
        self.put(msg_type, ts_ns, wire::encode_body(msg));
    }

    fn put(&self, msg_type: MessageType, ts_ns: u64, body: Bytes) {
        let (body, compressed) = match self.compression {
            CompressionConfig::Gzip => match gzip(&body) {
                Ok(z) => (z, true),
                Err(err) => {
                    debug!(%err, "gzip failed, sending uncompressed");
                    (body, false)
                },
            },
            CompressionConfig::None => (body, false),
        };

        let frame = Frame {
            msg_type,
            compressed,
            ts_ns,
            body,
        };

        if !self.sink.put(frame, msg_type.priority()) {
            self.dropped[msg_type.index()].fetch_add(1, Ordering::Relaxed);
            debug!(?msg_type, "queue full, discarding frame");
        }
    }
}

fn gzip(body: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), GzLevel::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Bounded three-lane priority queue between the agent and its transport.
///
/// `put` is non-blocking and drops on a full queue; `pop` serves High
/// before Medium before Low and can wait up to a timeout for the next
/// frame.
pub struct BoundedSinkQueue {
    lanes: Mutex<Lanes>,
    available: Condvar,
    capacity: usize,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<Frame>,
    medium: VecDeque<Frame>,
    low: VecDeque<Frame>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    fn pop(&mut self) -> Option<Frame> {
        self.high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

impl BoundedSinkQueue {
    /// Creates a queue bounded to `capacity` frames across all lanes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().expect("sink queue poisoned").len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the next frame by priority, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        let mut lanes = self.lanes.lock().expect("sink queue poisoned");
        if let Some(frame) = lanes.pop() {
            return Some(frame);
        }
        let (mut lanes, _) = self
            .available
            .wait_timeout(lanes, timeout)
            .expect("sink queue poisoned");
        lanes.pop()
    }
}

impl Sink for BoundedSinkQueue {
    fn put(&self, frame: Frame, priority: Priority) -> bool {
        let mut lanes = self.lanes.lock().expect("sink queue poisoned");
        if lanes.len() >= self.capacity {
            return false;
        }
        match priority {
            Priority::High => lanes.high.push_back(frame),
            Priority::Medium => lanes.medium.push_back(frame),
            Priority::Low => lanes.low.push_back(frame),
        }
        drop(lanes);
        self.available.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_frame_round_trip_uncompressed() {
        let frame = Frame {
            msg_type: MessageType::PolicyEvents,
            compressed: false,
            ts_ns: 99,
            body: Bytes::from_static(b"payload"),
        };
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::PolicyEvents);
        assert_eq!(decoded.ts_ns, 99);
        assert_eq!(decoded.body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_handler_compresses_when_negotiated() {
        let queue = Arc::new(BoundedSinkQueue::new(4));
        let handler = EgressHandler::new(queue.clone(), CompressionConfig::Gzip);

        handler.metrics_sample_ready(7, Bytes::from(vec![0u8; 4096]));

        let frame = queue.pop(Duration::from_millis(10)).unwrap();
        assert!(frame.compressed);
        assert!(frame.body.len() < 4096);

        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.body.len(), 4096);
    }

    #[test]
    fn test_queue_full_drops_and_counts() {
        let queue = Arc::new(BoundedSinkQueue::new(1));
        let handler = EgressHandler::new(queue.clone(), CompressionConfig::None);

        handler.metrics_sample_ready(1, Bytes::from_static(b"a"));
        handler.metrics_sample_ready(2, Bytes::from_static(b"b"));

        assert_eq!(queue.len(), 1);
        assert_eq!(handler.dropped(MessageType::Metrics), 1);
    }

    #[test]
    fn test_pop_serves_high_priority_first() {
        let queue = BoundedSinkQueue::new(8);
        let frame = |t, ts| Frame {
            msg_type: t,
            compressed: false,
            ts_ns: ts,
            body: Bytes::new(),
        };
        assert!(queue.put(frame(MessageType::CompResults, 1), Priority::Low));
        assert!(queue.put(frame(MessageType::Metrics, 2), Priority::Medium));
        assert!(queue.put(frame(MessageType::Metrics, 3), Priority::High));

        let order: Vec<u64> = (0..3)
            .map(|_| queue.pop(Duration::from_millis(5)).unwrap().ts_ns)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }
}
