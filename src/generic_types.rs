use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies one inbound connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One complete top-level JSON object cut out of a connection's byte stream.
///
/// Frames are moved, never shared: the reassembler hands one to the queue and
/// exactly one parser worker takes it back out.
#[derive(Debug)]
pub struct Frame {
    pub connection: ConnectionId,
    pub bytes: Bytes,
    pub received_at: Instant,
}

impl Frame {
    pub fn new(connection: ConnectionId, bytes: Bytes) -> Self {
        Self { connection, bytes, received_at: Instant::now() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Time spent between reassembly and `now`, usually the moment a worker
    /// picked the frame up.
    pub fn queued_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }
}

/// A single beacon record.
///
/// The trailing performance fields are informational and default to zero when
/// a sender omits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconMessage {
    pub source_id: String,
    pub message_type: String,
    pub timestamp_ns: u64,
    pub payload: String,
    pub sequence_number: u32,
    pub is_critical: bool,
    #[serde(default)]
    pub simd_capability: u32,
    #[serde(default)]
    pub parse_time_us: f64,
    #[serde(default)]
    pub message_size: u32,
}

impl BeaconMessage {
    /// Milliseconds between the sender's timestamp and now. Clock skew that
    /// would make this negative is clamped to zero.
    pub fn latency_ms(&self, now_ns: u64) -> f64 {
        now_ns.saturating_sub(self.timestamp_ns) as f64 / 1_000_000.0
    }
}

/// A group of beacon records sent as one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    pub messages: Vec<BeaconMessage>,
    pub batch_id: u32,
    pub compression_ratio: u64,
}

/// Either schema, as decoded from a frame or queued for broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Single(BeaconMessage),
    Batch(BatchMessage),
}

impl DecodedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedMessage::Single(_) => "single",
            DecodedMessage::Batch(_) => "batch",
        }
    }

    /// Number of beacon records carried.
    pub fn record_count(&self) -> usize {
        match self {
            DecodedMessage::Single(_) => 1,
            DecodedMessage::Batch(batch) => batch.messages.len(),
        }
    }
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
