// -----------------------------------------------------------------------------
// Lighthouse: binds the listeners and wires every component together.
//
//   ingest connections -> StreamReassembler -> MessageQueue -> ParserPool
//                                                                 |
//                                                           RunningStats
//   BeaconSource (+ relayed records) -> BatchAssembler -> Broadcaster -> peers
//
// Shutdown order: stop accepting, let connection tasks drop their queue
// producers, wait for the pool to drain, stop the outbound loops (which flush
// once more), then close every subscriber.
// -----------------------------------------------------------------------------

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::batch::BatchAssembler;
use crate::broadcast::beacon::{run_beacons, run_flusher, BeaconSource};
use crate::broadcast::broadcaster::{Broadcaster, OutboundSink};
use crate::broadcast::registry::ListenerRegistry;
use crate::config::{BroadcastMode, Config};
use crate::error::{LighthouseError, Result};
use crate::generic_types::ConnectionId;
use crate::request_parser::parser::{Codec, JsonCodec};
use crate::request_parser::pool::ParserPool;
use crate::stats::{RunningStats, StatsSnapshot};
use crate::stream::{MessageQueue, QueueProducer, StreamReassembler};

pub struct Lighthouse {
    config: Config,
    ingest: TcpListener,
    subscribers: Option<TcpListener>,
    sink: OutboundSink,
    codec: Arc<dyn Codec>,
    stats: Arc<RunningStats>,
    cancel: CancellationToken,
}

impl Lighthouse {
    /// Bind every socket up front so startup failures surface before anything
    /// is spawned.
    pub async fn bind(config: Config) -> Result<Self> {
        Self::bind_with_codec(config, Arc::new(JsonCodec::new())).await
    }

    pub async fn bind_with_codec(config: Config, codec: Arc<dyn Codec>) -> Result<Self> {
        config.validate()?;

        let ingest_addr = config.ingest_addr()?;
        let ingest = TcpListener::bind(ingest_addr)
            .await
            .map_err(|e| LighthouseError::bind(ingest_addr, e))?;

        let cancel = CancellationToken::new();
        let (subscribers, sink) = match config.broadcast.mode {
            BroadcastMode::Peers => {
                let addr = config.subscriber_addr()?;
                let listener = TcpListener::bind(addr).await.map_err(|e| LighthouseError::bind(addr, e))?;
                let registry = ListenerRegistry::with_shutdown(cancel.clone());
                (Some(listener), OutboundSink::Peers(Arc::new(registry)))
            }
            BroadcastMode::Datagram => (None, OutboundSink::datagram(config.target_addr()?).await?),
        };

        let stats = Arc::new(RunningStats::new(config.fast_decode_threshold()));

        Ok(Self {
            config,
            ingest,
            subscribers,
            sink,
            codec,
            stats,
            cancel,
        })
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        self.ingest
            .local_addr()
            .map_err(|e| LighthouseError::transport("ingest local address", e))
    }

    pub fn subscriber_addr(&self) -> Option<SocketAddr> {
        self.subscribers.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Subscriber registry; `None` in datagram mode.
    pub fn registry(&self) -> Option<Arc<ListenerRegistry>> {
        match &self.sink {
            OutboundSink::Peers(registry) => Some(registry.clone()),
            OutboundSink::Datagram { .. } => None,
        }
    }

    pub fn stats(&self) -> Arc<RunningStats> {
        self.stats.clone()
    }

    /// Cancelling this token starts the shutdown sequence.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs until the cancel token fires, then shuts down in order and
    /// returns the final statistics.
    pub async fn run(self) -> Result<StatsSnapshot> {
        let Lighthouse { config, ingest, subscribers, sink, codec, stats, cancel } = self;

        if let Ok(addr) = ingest.local_addr() {
            info!(%addr, "accepting beacon streams");
        }
        info!("{}", config);

        let registry = match &sink {
            OutboundSink::Peers(registry) => Some(registry.clone()),
            OutboundSink::Datagram { .. } => None,
        };
        let broadcaster = Arc::new(Broadcaster::new(sink, codec.clone(), stats.clone(), config.write_timeout()));

        let batching = config.batching();
        let relay = config.broadcast.relay_inbound;
        let assembler = (batching || relay)
            .then(|| Arc::new(BatchAssembler::new(codec.clone(), stats.clone(), config.broadcast.max_pending)));

        // Inbound side.
        let (producer, consumer) = MessageQueue::bounded(config.ingest.queue_capacity);
        let pool = ParserPool::spawn(
            config.parser.workers,
            consumer,
            codec,
            stats.clone(),
            if relay { assembler.clone() } else { None },
        );

        let reporter = config
            .report_interval()
            .map(|period| tokio::spawn(report_stats(stats.clone(), producer.clone(), period, cancel.clone())));

        let ingest_task = tokio::spawn(accept_ingest(
            ingest,
            producer,
            stats.clone(),
            ConnectionSettings {
                max_frame_bytes: config.ingest.max_frame_bytes,
                read_buffer: config.ingest.read_buffer,
            },
            cancel.clone(),
        ));

        let subscriber_task = match (subscribers, &registry) {
            (Some(listener), Some(registry)) => {
                if let Ok(addr) = listener.local_addr() {
                    info!(%addr, "accepting subscribers");
                }
                Some(tokio::spawn(accept_subscribers(listener, registry.clone(), cancel.clone())))
            }
            _ => None,
        };

        // Outbound side runs until the pool has drained, so relayed records
        // still make the final flush.
        let outbound = CancellationToken::new();
        let beacon_task = tokio::spawn(run_beacons(
            BeaconSource::new(config.broadcast.source_id.clone()),
            broadcaster.clone(),
            if batching { assembler.clone() } else { None },
            config.interval(),
            outbound.clone(),
        ));
        let flush_task = assembler.map(|assembler| {
            tokio::spawn(run_flusher(
                assembler,
                broadcaster.clone(),
                config.broadcast.batch_size,
                config.flush_interval(),
                outbound.clone(),
            ))
        });

        cancel.cancelled().await;
        info!("shutting down");

        join("ingest", ingest_task).await;
        if let Some(task) = reporter {
            join("stats reporter", task).await;
        }
        pool.join().await;

        outbound.cancel();
        join("beacon", beacon_task).await;
        if let Some(task) = flush_task {
            join("flusher", task).await;
        }

        if let Some(registry) = &registry {
            registry.close_all().await;
        }
        if let Some(task) = subscriber_task {
            join("subscribers", task).await;
        }

        let snapshot = stats.snapshot();
        info!("final stats: {}", snapshot);
        Ok(snapshot)
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task = name, "task failed: {}", e);
    }
}

// -----------------------------------------------------------------------------
// Ingest side
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    max_frame_bytes: usize,
    read_buffer: usize,
}

async fn accept_ingest(
    listener: TcpListener,
    producer: QueueProducer,
    stats: Arc<RunningStats>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection = ConnectionId(next_id);
                    next_id += 1;
                    connections.spawn(handle_ingest(
                        stream,
                        peer,
                        connection,
                        producer.clone(),
                        stats.clone(),
                        settings,
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!("ingest accept failed: {}", e),
            }
        }
    }

    drop(listener);
    drop(producer);
    while connections.join_next().await.is_some() {}
    debug!("ingest accept loop stopped");
}

async fn handle_ingest(
    mut stream: TcpStream,
    peer: SocketAddr,
    connection: ConnectionId,
    producer: QueueProducer,
    stats: Arc<RunningStats>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) {
    stats.connection_opened();
    info!(%connection, %peer, "ingest connection opened");

    let mut reassembler = StreamReassembler::with_max_frame_bytes(connection, settings.max_frame_bytes);
    let mut buf = vec![0u8; settings.read_buffer];
    let mut framing_errors = 0u64;
    let mut frames = 0u64;

    'read: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(%connection, "read failed: {}", e);
                    break;
                }
            }
        };

        stats.record_chunk(n);
        let ready = reassembler.feed(&buf[..n]);

        let seen = reassembler.framing_errors();
        stats.record_framing_errors(seen - framing_errors);
        framing_errors = seen;

        for frame in ready {
            tokio::select! {
                _ = cancel.cancelled() => break 'read,
                sent = producer.enqueue(frame) => {
                    if sent.is_err() {
                        break 'read;
                    }
                    frames += 1;
                }
            }
        }
    }

    if let Err(e) = reassembler.finish() {
        stats.record_truncated_input();
        warn!("{}", e);
    }
    stats.connection_closed();
    info!(%connection, %peer, frames, framing_errors, "ingest connection closed");
}

// -----------------------------------------------------------------------------
// Subscriber side
// -----------------------------------------------------------------------------

async fn accept_subscribers(listener: TcpListener, registry: Arc<ListenerRegistry>, cancel: CancellationToken) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, "could not set TCP_NODELAY: {}", e);
                    }
                    let (mut read_half, write_half) = stream.into_split();
                    let (id, closed) = registry.register_with_close(addr, Box::new(write_half)).await;

                    let registry = registry.clone();
                    // Subscribers never send anything meaningful; reading only
                    // notices the close early. The read half is released as
                    // soon as the peer is removed for any reason.
                    readers.spawn(async move {
                        let mut scratch = [0u8; 256];
                        loop {
                            tokio::select! {
                                _ = closed.cancelled() => break,
                                read = read_half.read(&mut scratch) => match read {
                                    Ok(0) | Err(_) => {
                                        registry.unregister(id).await;
                                        break;
                                    }
                                    Ok(_) => {}
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("subscriber accept failed: {}", e),
            }
        }
    }

    while readers.join_next().await.is_some() {}
    debug!("subscriber accept loop stopped");
}

// -----------------------------------------------------------------------------
// Reporting
// -----------------------------------------------------------------------------

async fn report_stats(stats: Arc<RunningStats>, queue: QueueProducer, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                info!(queue_depth = queue.depth(), queue_capacity = queue.capacity(), "{}", snapshot);
            }
        }
    }
}
