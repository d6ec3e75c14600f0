use std::path::PathBuf;

use clap::Parser;

use crate::config::{BroadcastMode, Config};
use crate::error::Result;

/// Command-line overrides, applied on top of the file and environment layers.
#[derive(Debug, Default, Parser)]
#[command(name = "rs_lighthouse")]
#[command(about = "Beacon telemetry ingest and broadcast service")]
pub struct Options {
    /// Configuration file (defaults to ./lighthouse.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port for inbound beacon streams
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Datagram target host
    #[arg(long)]
    pub target: Option<String>,

    /// Datagram target port
    #[arg(long)]
    pub target_port: Option<u16>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Records per outbound batch (1 sends singles)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Parser workers (0 = one per core)
    #[arg(long)]
    pub parse_threads: Option<usize>,

    /// Outbound mode: peers or datagram
    #[arg(long)]
    pub mode: Option<BroadcastMode>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Options {
    /// Overwrite every field that was given on the command line, then re-check.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(port) = self.listen_port {
            config.ingest.port = port;
        }
        if let Some(host) = &self.target {
            config.broadcast.target_host = host.clone();
        }
        if let Some(port) = self.target_port {
            config.broadcast.target_port = port;
        }
        if let Some(ms) = self.interval {
            config.broadcast.interval_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.broadcast.batch_size = size;
        }
        if let Some(workers) = self.parse_threads {
            config.parser.workers = workers;
        }
        if let Some(mode) = self.mode {
            config.broadcast.mode = mode;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.validate()
    }

    /// Layered load: defaults, file, environment, command line.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        self.apply(&mut config)?;
        Ok(config)
    }
}
