// -----------------------------------------------------------------------------
// BatchAssembler: collects outbound beacon records and hands them out in
// bounded batches. Flushing never waits for a batch to fill up; latency is
// bounded by the flush interval of whoever calls `flush`.
// -----------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use crate::generic_types::{BatchMessage, BeaconMessage, DecodedMessage};
use crate::request_parser::parser::Codec;
use crate::stats::RunningStats;

/// Size a record is assumed to take on its own, for the efficiency ratio.
pub const NOMINAL_MESSAGE_BYTES: u64 = 400;

pub const DEFAULT_MAX_PENDING: usize = 4096;

/// One flushed batch, ready for a single broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundBatch {
    batch: BatchMessage,
}

impl OutboundBatch {
    pub fn batch_id(&self) -> u32 {
        self.batch.batch_id
    }

    pub fn messages(&self) -> &[BeaconMessage] {
        &self.batch.messages
    }

    pub fn len(&self) -> usize {
        self.batch.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.messages.is_empty()
    }

    /// Reporting only: nominal size of the records sent one by one, as a
    /// percentage of the batch's serialized size.
    pub fn compression_ratio(&self) -> u64 {
        self.batch.compression_ratio
    }

    pub fn into_message(self) -> DecodedMessage {
        DecodedMessage::Batch(self.batch)
    }
}

pub struct BatchAssembler {
    pending: Mutex<VecDeque<BeaconMessage>>,
    max_pending: usize,
    next_batch_id: AtomicU32,
    codec: Arc<dyn Codec>,
    stats: Arc<RunningStats>,
}

impl BatchAssembler {
    pub fn new(codec: Arc<dyn Codec>, stats: Arc<RunningStats>, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(max_pending.min(1024))),
            max_pending,
            next_batch_id: AtomicU32::new(0),
            codec,
            stats,
        }
    }

    /// Queue a record for the next flush. When the pending set is full the
    /// oldest record is dropped and counted; returns `false` in that case.
    pub fn offer(&self, message: BeaconMessage) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let mut kept_all = true;
        while pending.len() >= self.max_pending {
            pending.pop_front();
            kept_all = false;
        }
        pending.push_back(message);
        drop(pending);

        if !kept_all {
            self.stats.record_outbound_dropped(1);
            warn!(max_pending = self.max_pending, "outbound backlog full, dropped oldest record");
        }
        kept_all
    }

    /// Drain up to `max_size` records into a batch. Returns `None` when
    /// nothing is pending; a partial batch is returned as-is.
    pub fn flush(&self, max_size: usize) -> Option<OutboundBatch> {
        let messages: Vec<BeaconMessage> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let take = max_size.max(1).min(pending.len());
            pending.drain(..take).collect()
        };

        if messages.is_empty() {
            return None;
        }

        let mut batch = BatchMessage {
            messages,
            batch_id: self.next_batch_id.fetch_add(1, Ordering::Relaxed),
            compression_ratio: 0,
        };
        batch.compression_ratio = self.efficiency_ratio(&batch);

        trace!(
            batch_id = batch.batch_id,
            records = batch.messages.len(),
            compression = batch.compression_ratio,
            "batch assembled"
        );
        Some(OutboundBatch { batch })
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn efficiency_ratio(&self, batch: &BatchMessage) -> u64 {
        match self.codec.encode_batch(batch) {
            Ok(bytes) if !bytes.is_empty() => {
                NOMINAL_MESSAGE_BYTES * batch.messages.len() as u64 * 100 / bytes.len() as u64
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(batch_id = batch.batch_id, "could not size batch: {}", e);
                0
            }
        }
    }
}
