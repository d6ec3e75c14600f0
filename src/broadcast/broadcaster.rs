// -----------------------------------------------------------------------------
// Broadcaster: serializes one payload per cycle and fans it out.
//
// Stream peers are written concurrently, each write bounded by the configured
// timeout. Any failure removes the peer; removals are applied only after the
// whole fan-out has completed. Datagram mode sends to one fixed destination
// and never removes anything.
// -----------------------------------------------------------------------------

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::future::join_all;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::broadcast::registry::ListenerRegistry;
use crate::error::{LighthouseError, Result};
use crate::generic_types::DecodedMessage;
use crate::request_parser::parser::Codec;
use crate::stats::RunningStats;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

pub enum OutboundSink {
    Peers(Arc<ListenerRegistry>),
    Datagram { socket: UdpSocket, target: SocketAddr },
}

impl OutboundSink {
    pub async fn datagram(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| LighthouseError::bind(local, e))?;
        Ok(OutboundSink::Datagram { socket, target })
    }
}

/// Outcome of one broadcast cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub bytes: usize,
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Broadcaster {
    sink: OutboundSink,
    codec: Arc<dyn Codec>,
    stats: Arc<RunningStats>,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        sink: OutboundSink,
        codec: Arc<dyn Codec>,
        stats: Arc<RunningStats>,
        write_timeout: Duration,
    ) -> Self {
        Self { sink, codec, stats, write_timeout }
    }

    pub fn registry(&self) -> Option<&Arc<ListenerRegistry>> {
        match &self.sink {
            OutboundSink::Peers(registry) => Some(registry),
            OutboundSink::Datagram { .. } => None,
        }
    }

    /// Serialize once and deliver to every current destination.
    /// Only an encoding failure is returned as an error.
    pub async fn broadcast(&self, message: &DecodedMessage) -> Result<BroadcastReport> {
        let encoded = self.codec.encode(message)?;

        let report = match &self.sink {
            OutboundSink::Peers(registry) => {
                let mut payload = BytesMut::with_capacity(encoded.len() + 1);
                payload.put_slice(&encoded);
                payload.put_u8(b'\n');
                self.fan_out(registry, &payload).await
            }
            OutboundSink::Datagram { socket, target } => match socket.send_to(&encoded, target).await {
                Ok(sent) => BroadcastReport { bytes: sent, delivered: 1, dropped: 0 },
                Err(e) => {
                    debug!(%target, "datagram send failed: {}", e);
                    BroadcastReport { bytes: encoded.len(), delivered: 0, dropped: 0 }
                }
            },
        };

        self.stats.record_broadcast(report.delivered, report.dropped);
        debug!(
            kind = message.kind(),
            records = message.record_count(),
            bytes = report.bytes,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast"
        );
        Ok(report)
    }

    async fn fan_out(&self, registry: &ListenerRegistry, payload: &[u8]) -> BroadcastReport {
        let peers = registry.snapshot().await;
        let timeout = self.write_timeout;

        let results = join_all(peers.iter().map(|peer| async move {
            (peer.id(), peer.addr(), peer.send(payload, timeout).await)
        }))
        .await;

        let mut report = BroadcastReport { bytes: payload.len(), ..Default::default() };
        for (id, addr, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    if registry.unregister(id).await.is_some() {
                        report.dropped += 1;
                        warn!(peer = %id, %addr, "dropping subscriber: {}", e);
                    }
                }
            }
        }
        report
    }
}
