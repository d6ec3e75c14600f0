use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

use rs_lighthouse::{
    Codec, Config, DecodedMessage, JsonCodec, Lighthouse, LighthouseError, ListenerRegistry, RunningStats, StatsSnapshot,
};

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config() -> Config {
    let mut config = Config::default();
    config.ingest.host = "127.0.0.1".into();
    config.ingest.port = 0;
    config.broadcast.subscriber_host = "127.0.0.1".into();
    config.broadcast.subscriber_port = 0;
    config.broadcast.interval_ms = 50;
    config.broadcast.batch_size = 1;
    config.parser.workers = 2;
    config.stats.report_interval_secs = 0;
    config
}

async fn wait_for(stats: &RunningStats, what: &str, done: impl Fn(&StatsSnapshot) -> bool) {
    let deadline = Instant::now() + WAIT;
    loop {
        if done(&stats.snapshot()) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

struct Running {
    ingest: SocketAddr,
    subscribers: Option<SocketAddr>,
    registry: Option<Arc<ListenerRegistry>>,
    stats: Arc<RunningStats>,
    cancel: tokio_util::sync::CancellationToken,
    handle: tokio::task::JoinHandle<rs_lighthouse::Result<StatsSnapshot>>,
}

async fn start(config: Config) -> Running {
    let server = Lighthouse::bind(config).await.unwrap();
    Running {
        ingest: server.ingest_addr().unwrap(),
        subscribers: server.subscriber_addr(),
        registry: server.registry(),
        stats: server.stats(),
        cancel: server.cancel_token(),
        handle: tokio::spawn(server.run()),
    }
}

impl Running {
    async fn stop(self) -> StatsSnapshot {
        self.cancel.cancel();
        timeout(WAIT, self.handle).await.expect("shutdown hung").unwrap().unwrap()
    }
}

async fn next_payload(lines: &mut tokio::io::Lines<BufReader<TcpStream>>) -> DecodedMessage {
    let line = timeout(WAIT, lines.next_line())
        .await
        .expect("no payload in time")
        .unwrap()
        .expect("subscriber stream closed");
    JsonCodec.decode(line.as_bytes()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_heartbeat_is_decoded_and_subscribers_hear_beacons() {
    let mut config = loopback_config();
    config.broadcast.source_id = "test-lighthouse".into();
    let running = start(config).await;

    let subscriber = TcpStream::connect(running.subscribers.unwrap()).await.unwrap();
    let mut lines = BufReader::new(subscriber).lines();

    let mut client = TcpStream::connect(running.ingest).await.unwrap();
    client
        .write_all(br#"{"source_id":"a","message_type":"heartbeat","timestamp_ns":1,"#)
        .await
        .unwrap();
    client.flush().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    client.write_all(br#""payload":"x","sequence_number":0,"is_critical":false}"#).await.unwrap();
    client.flush().await.unwrap();

    wait_for(&running.stats, "one decode", |s| s.decode_successes == 1).await;

    match next_payload(&mut lines).await {
        DecodedMessage::Single(beacon) => {
            assert_eq!(beacon.source_id, "test-lighthouse");
            assert_eq!(beacon.message_type, "heartbeat");
        }
        other => panic!("expected a single heartbeat, got {:?}", other),
    }

    drop(client);
    let snapshot = running.stop().await;
    assert_eq!(snapshot.decode_successes, 1);
    assert_eq!(snapshot.singles_decoded, 1);
    assert_eq!(snapshot.decode_errors, 0);
    assert_eq!(snapshot.connections_accepted, 1);
    assert!(snapshot.chunks_received >= 1);
    assert!(snapshot.peer_deliveries >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relayed_records_reach_subscribers_in_batches() {
    let mut config = loopback_config();
    config.broadcast.batch_size = 5;
    config.broadcast.interval_ms = 60_000;
    config.broadcast.relay_inbound = true;
    let running = start(config).await;

    let subscriber = TcpStream::connect(running.subscribers.unwrap()).await.unwrap();
    let mut lines = BufReader::new(subscriber).lines();
    // The subscriber has to be registered before anything is relayed.
    sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(running.ingest).await.unwrap();
    let mut body = String::new();
    for seq in 0..3 {
        body.push_str(&format!(
            r#"{{"source_id":"remote","message_type":"status","timestamp_ns":1,"payload":"p","sequence_number":{},"is_critical":false}}"#,
            seq
        ));
        body.push('\n');
    }
    client.write_all(body.as_bytes()).await.unwrap();
    client.flush().await.unwrap();

    let mut relayed = Vec::new();
    while relayed.len() < 3 {
        match next_payload(&mut lines).await {
            DecodedMessage::Batch(batch) => {
                assert!(batch.messages.len() <= 5);
                relayed.extend(
                    batch
                        .messages
                        .into_iter()
                        .filter(|m| m.source_id == "remote")
                        .map(|m| m.sequence_number),
                );
            }
            other => panic!("expected a batch, got {:?}", other),
        }
    }
    relayed.sort_unstable();
    assert_eq!(relayed, vec![0, 1, 2]);

    drop(client);
    let snapshot = running.stop().await;
    assert_eq!(snapshot.decode_successes, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn framing_problems_are_counted_not_fatal() {
    let running = start(loopback_config()).await;

    let mut client = TcpStream::connect(running.ingest).await.unwrap();
    client
        .write_all(br#"} {"hello":"world"} {"source_id":"a","#)
        .await
        .unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    wait_for(&running.stats, "connection close", |s| {
        s.truncated_inputs == 1 && s.active_connections == 0
    })
    .await;

    let snapshot = running.stop().await;
    assert_eq!(snapshot.framing_errors, 1);
    assert_eq!(snapshot.truncated_inputs, 1);
    assert_eq!(snapshot.decode_errors, 1);
    assert_eq!(snapshot.decode_successes, 0);
}

#[tokio::test]
async fn dead_subscriber_is_dropped() {
    let mut config = loopback_config();
    config.broadcast.interval_ms = 20;
    let running = start(config).await;

    let subscriber = TcpStream::connect(running.subscribers.unwrap()).await.unwrap();
    let mut lines = BufReader::new(subscriber).lines();
    next_payload(&mut lines).await;
    drop(lines);

    let registry = running.registry.clone().unwrap();
    let deadline = Instant::now() + WAIT;
    while !registry.is_empty().await {
        assert!(Instant::now() < deadline, "closed subscriber still registered");
        sleep(Duration::from_millis(10)).await;
    }

    // Later cycles have nobody left to write to.
    let before = running.stats.snapshot().peer_deliveries;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(running.stats.snapshot().peer_deliveries, before);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_subscriber_socket_is_released() {
    let mut config = loopback_config();
    config.broadcast.interval_ms = 60_000;
    let running = start(config).await;
    let registry = running.registry.clone().unwrap();

    let mut subscriber = TcpStream::connect(running.subscribers.unwrap()).await.unwrap();
    let deadline = Instant::now() + WAIT;
    while registry.is_empty().await {
        assert!(Instant::now() < deadline, "subscriber never registered");
        sleep(Duration::from_millis(10)).await;
    }

    // The subscriber keeps its socket open; the server drops it the way a
    // failed write would.
    let peer = registry.snapshot().await.remove(0);
    let removed = registry.unregister(peer.id()).await;
    assert!(removed.is_some());
    drop(removed);
    drop(peer);

    let mut scratch = [0u8; 1024];
    loop {
        let n = timeout(WAIT, subscriber.read(&mut scratch))
            .await
            .expect("server never closed its write side")
            .unwrap_or(0);
        if n == 0 {
            break;
        }
    }

    // With the read half gone too, the socket is closed and writes bounce.
    let mut rejected = false;
    for _ in 0..40 {
        if subscriber.write_all(b"still here\n").await.is_err() {
            rejected = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(rejected, "server still holds the removed subscriber's socket");

    running.stop().await;
}

#[tokio::test]
async fn bind_failure_is_fatal() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = loopback_config();
    config.ingest.port = taken.local_addr().unwrap().port();

    match Lighthouse::bind(config).await {
        Err(e @ LighthouseError::Bind { .. }) => assert!(e.is_fatal()),
        Err(other) => panic!("expected a bind error, got {}", other),
        Ok(_) => panic!("bind should have failed"),
    }
}

#[tokio::test]
async fn datagram_mode_sends_to_target() {
    let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = loopback_config();
    config.broadcast.mode = rs_lighthouse::BroadcastMode::Datagram;
    config.broadcast.target_port = receiver.local_addr().unwrap().port();
    let running = start(config).await;
    assert!(running.subscribers.is_none());

    let mut buf = vec![0u8; 4096];
    let n = timeout(WAIT, receiver.recv(&mut buf)).await.expect("no datagram").unwrap();
    assert!(matches!(JsonCodec.decode(&buf[..n]).unwrap(), DecodedMessage::Single(_)));

    running.stop().await;
}
