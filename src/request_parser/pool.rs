// -----------------------------------------------------------------------------
// Parser pool: a fixed set of workers sharing one queue consumer.
//
// Each worker takes a frame, tries the single schema, then the batch schema,
// and records the decode latency. Batches are fully absorbed by the worker
// that dequeued them; nothing is pushed back onto the queue.
// -----------------------------------------------------------------------------

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::batch::BatchAssembler;
use crate::generic_types::{unix_nanos, BeaconMessage, DecodedMessage, Frame};
use crate::request_parser::parser::Codec;
use crate::stats::RunningStats;
use crate::stream::QueueConsumer;

/// Worker count used when the configuration asks for 0.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub struct PoolWorker {
    id: usize,
    queue: QueueConsumer,
    codec: Arc<dyn Codec>,
    stats: Arc<RunningStats>,
    // Decoded records are offered here when inbound relay is enabled.
    relay: Option<Arc<BatchAssembler>>,
}

impl PoolWorker {
    pub fn new(
        id: usize,
        queue: QueueConsumer,
        codec: Arc<dyn Codec>,
        stats: Arc<RunningStats>,
        relay: Option<Arc<BatchAssembler>>,
    ) -> Self {
        Self { id, queue, codec, stats, relay }
    }

    /// Runs until the queue is closed and drained.
    pub async fn run(self) {
        debug!(worker = self.id, "parser worker started");
        let mut handled = 0u64;

        while let Some(frame) = self.queue.dequeue().await {
            self.process(frame);
            handled += 1;

            // Decoding never awaits; give other tasks on this thread a turn.
            if handled % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!(worker = self.id, handled, "parser worker finished");
    }

    /// Decode one frame and account for it. Each frame is attempted exactly once.
    pub fn process(&self, frame: Frame) {
        let started = Instant::now();
        let queue_wait_us = frame.queued_for(started).as_micros() as u64;

        match self.codec.decode(&frame.bytes) {
            Ok(message) => {
                let elapsed = started.elapsed();
                self.stats.record_decode(elapsed, frame.len());
                self.absorb(&frame, message, elapsed, queue_wait_us);
            }
            Err(e) => {
                self.stats.record_decode_error(frame.len());
                debug!(worker = self.id, connection = %frame.connection, "dropping frame: {}", e);
            }
        }
    }

    fn absorb(&self, frame: &Frame, message: DecodedMessage, elapsed: Duration, queue_wait_us: u64) {
        let parse_us = elapsed.as_nanos() as f64 / 1_000.0;
        let now_ns = unix_nanos();

        match message {
            DecodedMessage::Single(mut msg) => {
                msg.parse_time_us = parse_us;
                self.stats.record_single();

                trace!(
                    worker = self.id,
                    connection = %frame.connection,
                    source = %msg.source_id,
                    kind = %msg.message_type,
                    seq = msg.sequence_number,
                    critical = msg.is_critical,
                    parse_us,
                    queue_wait_us,
                    latency_ms = msg.latency_ms(now_ns),
                    "beacon"
                );

                self.post_process(&msg, now_ns, None);
                self.relay(msg);
            }
            DecodedMessage::Batch(batch) => {
                self.stats.record_batch(batch.messages.len());

                debug!(
                    worker = self.id,
                    connection = %frame.connection,
                    batch_id = batch.batch_id,
                    records = batch.messages.len(),
                    compression = batch.compression_ratio,
                    parse_us,
                    queue_wait_us,
                    "batch"
                );

                for msg in batch.messages {
                    self.post_process(&msg, now_ns, Some(batch.batch_id));
                    self.relay(msg);
                }
            }
        }
    }

    fn post_process(&self, msg: &BeaconMessage, now_ns: u64, batch_id: Option<u32>) {
        if !msg.is_critical {
            return;
        }
        self.stats.record_critical();
        warn!(
            source = %msg.source_id,
            seq = msg.sequence_number,
            batch_id,
            latency_ms = msg.latency_ms(now_ns),
            "critical beacon"
        );
    }

    fn relay(&self, msg: BeaconMessage) {
        if let Some(assembler) = &self.relay {
            assembler.offer(msg);
        }
    }
}

/// Handle to the spawned workers.
pub struct ParserPool {
    workers: Vec<JoinHandle<()>>,
}

impl ParserPool {
    /// Spawn `workers` tasks (0 means one per available core).
    pub fn spawn(
        workers: usize,
        queue: QueueConsumer,
        codec: Arc<dyn Codec>,
        stats: Arc<RunningStats>,
        relay: Option<Arc<BatchAssembler>>,
    ) -> Self {
        let count = if workers == 0 { default_parallelism() } else { workers };

        let workers = (0..count)
            .map(|id| {
                let worker =
                    PoolWorker::new(id, queue.clone(), codec.clone(), stats.clone(), relay.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = count, "parser pool started");
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker. Workers exit once all queue producers are gone.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!("parser worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic_types::ConnectionId;
    use crate::request_parser::parser::JsonCodec;
    use crate::stream::MessageQueue;
    use bytes::Bytes;

    fn heartbeat(seq: u32, critical: bool) -> String {
        format!(
            r#"{{"source_id":"t","message_type":"heartbeat","timestamp_ns":1,"payload":"p","sequence_number":{},"is_critical":{}}}"#,
            seq, critical
        )
    }

    fn frame(body: String) -> Frame {
        Frame::new(ConnectionId(1), Bytes::from(body))
    }

    fn worker(stats: Arc<RunningStats>, relay: Option<Arc<BatchAssembler>>) -> PoolWorker {
        let (_tx, rx) = MessageQueue::bounded(1);
        PoolWorker::new(0, rx, Arc::new(JsonCodec), stats, relay)
    }

    #[test]
    fn counts_single_batch_and_errors() {
        let stats = Arc::new(RunningStats::default());
        let w = worker(stats.clone(), None);

        w.process(frame(heartbeat(0, false)));
        w.process(frame(format!(
            r#"{{"messages":[{},{}],"batch_id":3,"compression_ratio":0}}"#,
            heartbeat(1, true),
            heartbeat(2, false)
        )));
        w.process(frame(r#"{"not":"a beacon"}"#.to_string()));

        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 3);
        assert_eq!(snap.decode_successes, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.singles_decoded, 1);
        assert_eq!(snap.batches_decoded, 1);
        assert_eq!(snap.batch_records, 2);
        assert_eq!(snap.critical_records, 1);
    }

    #[test]
    fn relays_decoded_records_with_parse_time() {
        let stats = Arc::new(RunningStats::default());
        let assembler = Arc::new(BatchAssembler::new(Arc::new(JsonCodec), stats.clone(), 16));
        let w = worker(stats, Some(assembler.clone()));

        w.process(frame(heartbeat(9, false)));
        w.process(frame(format!(
            r#"{{"messages":[{}],"batch_id":1,"compression_ratio":0}}"#,
            heartbeat(10, false)
        )));

        let batch = assembler.flush(10).expect("relayed records");
        let seqs: Vec<u32> = batch.messages().iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![9, 10]);
        assert!(batch.messages()[0].parse_time_us > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_decodes_every_frame_exactly_once() {
        for (frames, workers) in [(0usize, 1usize), (1, 3), (257, 4), (1000, 7)] {
            let stats = Arc::new(RunningStats::default());
            let (tx, rx) = MessageQueue::bounded(16);
            let pool = ParserPool::spawn(workers, rx, Arc::new(JsonCodec), stats.clone(), None);
            assert_eq!(pool.size(), workers);

            for i in 0..frames {
                tx.enqueue(frame(heartbeat(i as u32, false))).await.unwrap();
            }
            drop(tx);
            pool.join().await;

            let snap = stats.snapshot();
            assert_eq!(snap.decode_successes, frames as u64);
            assert_eq!(snap.frames_processed, frames as u64);
        }
    }
}
