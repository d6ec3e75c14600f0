use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::broadcast::batch::DEFAULT_MAX_PENDING;
use crate::broadcast::broadcaster::DEFAULT_WRITE_TIMEOUT;
use crate::error::{LighthouseError, Result};
use crate::stats::DEFAULT_FAST_DECODE_THRESHOLD;
use crate::stream::reassembler::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_CONFIG_FILE: &str = "lighthouse";
pub const ENV_PREFIX: &str = "LIGHTHOUSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Subscribers connect over TCP and are written to as a set.
    Peers,
    /// One fixed UDP destination.
    Datagram,
}

impl fmt::Display for BroadcastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastMode::Peers => write!(f, "peers"),
            BroadcastMode::Datagram => write!(f, "datagram"),
        }
    }
}

impl std::str::FromStr for BroadcastMode {
    type Err = LighthouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "peers" => Ok(BroadcastMode::Peers),
            "datagram" | "udp" => Ok(BroadcastMode::Datagram),
            other => Err(LighthouseError::config(format!("unknown broadcast mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub host: String,
    pub port: u16,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub read_buffer: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9000,
            queue_capacity: 1024,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_buffer: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// 0 means one worker per available core.
    pub workers: usize,
    pub fast_decode_threshold_us: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            fast_decode_threshold_us: DEFAULT_FAST_DECODE_THRESHOLD.as_micros() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub mode: BroadcastMode,
    pub subscriber_host: String,
    pub subscriber_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub interval_ms: u64,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    pub max_pending: usize,
    pub write_timeout_ms: u64,
    pub relay_inbound: bool,
    pub source_id: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            mode: BroadcastMode::Peers,
            subscriber_host: "0.0.0.0".into(),
            subscriber_port: 9876,
            target_host: "127.0.0.1".into(),
            target_port: 9001,
            interval_ms: 1000,
            flush_interval_ms: 10,
            batch_size: 10,
            max_pending: DEFAULT_MAX_PENDING,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            relay_inbound: false,
            source_id: "whispr-lighthouse".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// 0 disables the periodic report.
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { report_interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub parser: ParserConfig,
    pub broadcast: BroadcastConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults, then the config file (optional unless given explicitly),
    /// then `LIGHTHOUSE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder: ConfigBuilder<DefaultState> = ConfigBuilder::default();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.ingest.queue_capacity > 0, "ingest.queue_capacity must be greater than 0"),
            (self.ingest.max_frame_bytes > 0, "ingest.max_frame_bytes must be greater than 0"),
            (self.ingest.read_buffer > 0, "ingest.read_buffer must be greater than 0"),
            (self.broadcast.batch_size > 0, "broadcast.batch_size must be greater than 0"),
            (self.broadcast.interval_ms > 0, "broadcast.interval_ms must be greater than 0"),
            (self.broadcast.flush_interval_ms > 0, "broadcast.flush_interval_ms must be greater than 0"),
            (self.broadcast.max_pending > 0, "broadcast.max_pending must be greater than 0"),
            (self.broadcast.write_timeout_ms > 0, "broadcast.write_timeout_ms must be greater than 0"),
        ];
        if let Some((_, reason)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(LighthouseError::config(*reason));
        }

        self.ingest_addr()?;
        self.subscriber_addr()?;
        self.target_addr()?;
        Ok(())
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.ingest.host, self.ingest.port)
    }

    pub fn subscriber_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.broadcast.subscriber_host, self.broadcast.subscriber_port)
    }

    pub fn target_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.broadcast.target_host, self.broadcast.target_port)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.write_timeout_ms)
    }

    pub fn fast_decode_threshold(&self) -> Duration {
        Duration::from_micros(self.parser.fast_decode_threshold_us)
    }

    /// `None` when periodic reporting is off.
    pub fn report_interval(&self) -> Option<Duration> {
        (self.stats.report_interval_secs > 0).then(|| Duration::from_secs(self.stats.report_interval_secs))
    }

    /// Heartbeats go through the assembler only when they are batched.
    pub fn batching(&self) -> bool {
        self.broadcast.batch_size > 1
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| LighthouseError::Address(format!("{}:{}", host, port)))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ingest={}:{} queue={} workers={} mode={} ",
            self.ingest.host,
            self.ingest.port,
            self.ingest.queue_capacity,
            self.parser.workers,
            self.broadcast.mode,
        )?;
        match self.broadcast.mode {
            BroadcastMode::Peers => write!(
                f,
                "subscribers={}:{}",
                self.broadcast.subscriber_host, self.broadcast.subscriber_port
            )?,
            BroadcastMode::Datagram => {
                write!(f, "target={}:{}", self.broadcast.target_host, self.broadcast.target_port)?
            }
        }
        write!(
            f,
            " interval={}ms batch_size={} relay_inbound={}",
            self.broadcast.interval_ms, self.broadcast.batch_size, self.broadcast.relay_inbound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ingest_addr().unwrap().port(), 9000);
        assert_eq!(config.subscriber_addr().unwrap().port(), 9876);
        assert_eq!(config.target_addr().unwrap(), "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.broadcast.batch_size, 10);
        assert!(config.batching());
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut config = Config::default();
        config.ingest.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(LighthouseError::Config(_))));

        let mut config = Config::default();
        config.broadcast.batch_size = 0;
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn bad_host_is_rejected() {
        let mut config = Config::default();
        config.broadcast.target_host = "not an ip".into();
        assert!(matches!(config.validate(), Err(LighthouseError::Address(_))));
    }

    #[test]
    fn mode_parses() {
        assert_eq!("peers".parse::<BroadcastMode>().unwrap(), BroadcastMode::Peers);
        assert_eq!("UDP".parse::<BroadcastMode>().unwrap(), BroadcastMode::Datagram);
        assert!("multicast".parse::<BroadcastMode>().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("lighthouse-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[ingest]\nport = 9100\n\n[broadcast]\nmode = \"datagram\"\nbatch_size = 1\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.ingest.port, 9100);
        assert_eq!(config.ingest.queue_capacity, 1024);
        assert_eq!(config.broadcast.mode, BroadcastMode::Datagram);
        assert!(!config.batching());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, LighthouseError::ConfigSource(_)));
    }
}
