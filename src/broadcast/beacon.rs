// -----------------------------------------------------------------------------
// Beacon source and the outbound loops.
//
// The beacon loop produces one heartbeat per interval. With batching enabled
// heartbeats go through the BatchAssembler and the flush loop broadcasts
// whatever is pending every flush interval; otherwise each heartbeat is
// broadcast on its own.
// -----------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::batch::BatchAssembler;
use crate::broadcast::broadcaster::Broadcaster;
use crate::generic_types::{unix_nanos, BeaconMessage, DecodedMessage};

pub const HEARTBEAT: &str = "heartbeat";

/// Widest vector unit the binary was compiled for, in bits.
pub fn detect_simd_capability() -> u32 {
    if cfg!(target_feature = "avx512f") {
        512
    } else if cfg!(target_feature = "avx2") {
        256
    } else if cfg!(any(target_feature = "avx", target_feature = "sse2", target_feature = "neon")) {
        128
    } else {
        64
    }
}

pub struct BeaconSource {
    source_id: String,
    next_sequence: u32,
    simd_capability: u32,
}

impl BeaconSource {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            next_sequence: 0,
            simd_capability: detect_simd_capability(),
        }
    }

    pub fn next_beacon(&mut self) -> BeaconMessage {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        BeaconMessage {
            source_id: self.source_id.clone(),
            message_type: HEARTBEAT.to_string(),
            timestamp_ns: unix_nanos(),
            payload: format!("{} seq:{}", self.source_id, seq),
            sequence_number: seq,
            is_critical: seq % 100 == 0,
            simd_capability: self.simd_capability,
            parse_time_us: 0.0,
            message_size: 0,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.next_sequence
    }
}

/// Heartbeats every `period` until cancelled. With an assembler the beacon
/// is queued for the flush loop, otherwise it is broadcast directly.
pub async fn run_beacons(
    mut source: BeaconSource,
    broadcaster: Arc<Broadcaster>,
    assembler: Option<Arc<BatchAssembler>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = period.as_millis() as u64, batched = assembler.is_some(), "beacon loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let beacon = source.next_beacon();
        if beacon.is_critical {
            debug!(seq = beacon.sequence_number, "critical heartbeat");
        }

        match &assembler {
            Some(assembler) => {
                assembler.offer(beacon);
            }
            None => {
                if let Err(e) = broadcaster.broadcast(&DecodedMessage::Single(beacon)).await {
                    warn!("heartbeat not sent: {}", e);
                }
            }
        }
    }

    info!(sent = source.sequence(), "beacon loop stopped");
}

/// Broadcast everything pending, `batch_size` records per payload.
/// Returns the number of payloads sent.
pub async fn flush_pending(assembler: &BatchAssembler, broadcaster: &Broadcaster, batch_size: usize) -> usize {
    let mut sent = 0;
    while let Some(batch) = assembler.flush(batch_size) {
        let batch_id = batch.batch_id();
        let message = if batch_size == 1 {
            // A one-record "batch" goes out in the single schema.
            match batch.messages().first() {
                Some(single) => DecodedMessage::Single(single.clone()),
                None => continue,
            }
        } else {
            batch.into_message()
        };

        match broadcaster.broadcast(&message).await {
            Ok(_) => sent += 1,
            Err(e) => warn!(batch_id, "batch not sent: {}", e),
        }
    }
    sent
}

/// Drains the assembler every `period`, and once more after cancellation so
/// nothing accepted before shutdown is left behind.
pub async fn run_flusher(
    assembler: Arc<BatchAssembler>,
    broadcaster: Arc<Broadcaster>,
    batch_size: usize,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(period_ms = period.as_millis() as u64, batch_size, "flush loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                flush_pending(&assembler, &broadcaster, batch_size).await;
            }
        }
    }

    let last = flush_pending(&assembler, &broadcaster, batch_size).await;
    debug!(final_payloads = last, "flush loop stopped");
}
