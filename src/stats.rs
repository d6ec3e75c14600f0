//! Running statistics shared by every parser worker and connection task.
//!
//! Each field is its own atomic so concurrent writers never serialise on a
//! common lock. Min/max use compare-and-retry loops; everything else is a
//! plain `fetch_add`. Readers take a [`StatsSnapshot`], which is only
//! eventually consistent across fields.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

pub const DEFAULT_FAST_DECODE_THRESHOLD: Duration = Duration::from_micros(10);

pub struct RunningStats {
    started: Instant,
    fast_decode_threshold_ns: u64,

    frames_processed: AtomicU64,
    decode_successes: AtomicU64,
    decode_errors: AtomicU64,
    decode_time_total_ns: AtomicU64,
    decode_time_min_ns: AtomicU64,
    decode_time_max_ns: AtomicU64,
    bytes_processed: AtomicU64,
    fast_decodes: AtomicU64,
    slow_decodes: AtomicU64,

    singles_decoded: AtomicU64,
    batches_decoded: AtomicU64,
    batch_records: AtomicU64,
    critical_records: AtomicU64,

    chunks_received: AtomicU64,
    bytes_received: AtomicU64,
    framing_errors: AtomicU64,
    truncated_inputs: AtomicU64,
    connections_accepted: AtomicU64,
    active_connections: AtomicU64,

    payloads_broadcast: AtomicU64,
    peer_deliveries: AtomicU64,
    peers_dropped: AtomicU64,
    outbound_dropped: AtomicU64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new(DEFAULT_FAST_DECODE_THRESHOLD)
    }
}

impl RunningStats {
    pub fn new(fast_decode_threshold: Duration) -> Self {
        Self {
            started: Instant::now(),
            fast_decode_threshold_ns: fast_decode_threshold.as_nanos() as u64,
            frames_processed: AtomicU64::new(0),
            decode_successes: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            decode_time_total_ns: AtomicU64::new(0),
            decode_time_min_ns: AtomicU64::new(u64::MAX),
            decode_time_max_ns: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            fast_decodes: AtomicU64::new(0),
            slow_decodes: AtomicU64::new(0),
            singles_decoded: AtomicU64::new(0),
            batches_decoded: AtomicU64::new(0),
            batch_records: AtomicU64::new(0),
            critical_records: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            truncated_inputs: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            payloads_broadcast: AtomicU64::new(0),
            peer_deliveries: AtomicU64::new(0),
            peers_dropped: AtomicU64::new(0),
            outbound_dropped: AtomicU64::new(0),
        }
    }

    /// A frame decoded successfully in `elapsed`.
    pub fn record_decode(&self, elapsed: Duration, bytes: usize) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;

        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.decode_successes.fetch_add(1, Ordering::Relaxed);
        self.decode_time_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes as u64, Ordering::Relaxed);

        if ns < self.fast_decode_threshold_ns {
            self.fast_decodes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slow_decodes.fetch_add(1, Ordering::Relaxed);
        }

        self.update_min(ns);
        self.update_max(ns);
    }

    /// A frame matched neither schema.
    pub fn record_decode_error(&self, bytes: usize) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn update_min(&self, ns: u64) {
        let mut current = self.decode_time_min_ns.load(Ordering::Relaxed);
        while ns < current {
            match self.decode_time_min_ns.compare_exchange_weak(
                current,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn update_max(&self, ns: u64) {
        let mut current = self.decode_time_max_ns.load(Ordering::Relaxed);
        while ns > current {
            match self.decode_time_max_ns.compare_exchange_weak(
                current,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn record_single(&self) {
        self.singles_decoded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_batch(&self, records: usize) {
        self.batches_decoded.fetch_add(1, Ordering::Relaxed);
        self.batch_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_critical(&self) {
        self.critical_records.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_framing_errors(&self, count: u64) {
        if count > 0 {
            self.framing_errors.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_truncated_input(&self) {
        self.truncated_inputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Gauge, not a counter: saturate instead of wrapping on a stray close.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_broadcast(&self, delivered: usize, dropped: usize) {
        self.payloads_broadcast.fetch_add(1, Ordering::Relaxed);
        self.peer_deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.peers_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbound_dropped(&self, count: usize) {
        self.outbound_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let min = load(&self.decode_time_min_ns);

        StatsSnapshot {
            elapsed: self.elapsed(),
            frames_processed: load(&self.frames_processed),
            decode_successes: load(&self.decode_successes),
            decode_errors: load(&self.decode_errors),
            decode_time_total_ns: load(&self.decode_time_total_ns),
            decode_time_min_ns: (min != u64::MAX).then_some(min),
            decode_time_max_ns: load(&self.decode_time_max_ns),
            bytes_processed: load(&self.bytes_processed),
            fast_decodes: load(&self.fast_decodes),
            slow_decodes: load(&self.slow_decodes),
            singles_decoded: load(&self.singles_decoded),
            batches_decoded: load(&self.batches_decoded),
            batch_records: load(&self.batch_records),
            critical_records: load(&self.critical_records),
            chunks_received: load(&self.chunks_received),
            bytes_received: load(&self.bytes_received),
            framing_errors: load(&self.framing_errors),
            truncated_inputs: load(&self.truncated_inputs),
            connections_accepted: load(&self.connections_accepted),
            active_connections: load(&self.active_connections),
            payloads_broadcast: load(&self.payloads_broadcast),
            peer_deliveries: load(&self.peer_deliveries),
            peers_dropped: load(&self.peers_dropped),
            outbound_dropped: load(&self.outbound_dropped),
        }
    }
}

/// Point-in-time copy of [`RunningStats`] plus the derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub frames_processed: u64,
    pub decode_successes: u64,
    pub decode_errors: u64,
    pub decode_time_total_ns: u64,
    pub decode_time_min_ns: Option<u64>,
    pub decode_time_max_ns: u64,
    pub bytes_processed: u64,
    pub fast_decodes: u64,
    pub slow_decodes: u64,
    pub singles_decoded: u64,
    pub batches_decoded: u64,
    pub batch_records: u64,
    pub critical_records: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub framing_errors: u64,
    pub truncated_inputs: u64,
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub payloads_broadcast: u64,
    pub peer_deliveries: u64,
    pub peers_dropped: u64,
    pub outbound_dropped: u64,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StatsSnapshot {
    pub fn average_decode_time(&self) -> Option<Duration> {
        (self.decode_successes > 0)
            .then(|| Duration::from_nanos(self.decode_time_total_ns / self.decode_successes))
    }

    /// Successful decodes over all attempts, 0.0..=1.0.
    pub fn success_rate(&self) -> f64 {
        if self.frames_processed == 0 {
            return 0.0;
        }
        self.decode_successes as f64 / self.frames_processed as f64
    }

    /// Bytes processed per second since the aggregator was created.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_processed as f64 / secs
    }

    pub fn fast_decode_ratio(&self) -> f64 {
        let total = self.fast_decodes + self.slow_decodes;
        if total == 0 {
            return 0.0;
        }
        self.fast_decodes as f64 / total as f64
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = |ns: u64| ns as f64 / 1_000.0;
        write!(
            f,
            "frames={} ok={} err={} success={:.1}% decode_us(min={:.3} avg={:.3} max={:.3}) \
             fast={:.1}% throughput={:.2}MB/s conns={} framing_errors={} truncated={} \
             broadcasts={} deliveries={} peers_dropped={}",
            self.frames_processed,
            self.decode_successes,
            self.decode_errors,
            self.success_rate() * 100.0,
            us(self.decode_time_min_ns.unwrap_or(0)),
            self.average_decode_time().map(|d| d.as_nanos() as f64 / 1_000.0).unwrap_or(0.0),
            us(self.decode_time_max_ns),
            self.fast_decode_ratio() * 100.0,
            self.throughput_bytes_per_sec() / (1024.0 * 1024.0),
            self.active_connections,
            self.framing_errors,
            self.truncated_inputs,
            self.payloads_broadcast,
            self.peer_deliveries,
            self.peers_dropped,
        )
    }
}
