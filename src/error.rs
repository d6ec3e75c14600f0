//! Error taxonomy for the lighthouse pipeline.
//!
//! Only startup-scope errors (bind failures, bad configuration) are fatal.
//! Everything raised while a connection or a frame is in flight is contained
//! by the component that sees it: counted in [`RunningStats`](crate::stats::RunningStats),
//! logged, and the service keeps running.

use std::io;
use std::net::SocketAddr;

use config::ConfigError;
use thiserror::Error;

use crate::generic_types::ConnectionId;

/// Result alias used across the crate.
pub type Result<T, E = LighthouseError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LighthouseError {
    /// Unbalanced braces, or a frame larger than the configured bound.
    #[error("Framing error on connection {connection}: {reason}")]
    Framing { connection: ConnectionId, reason: String },

    /// The connection closed while a frame was still open.
    #[error("Truncated input on connection {connection}: {buffered} bytes dropped")]
    TruncatedInput { connection: ConnectionId, buffered: usize },

    /// Well-formed JSON matching neither the single nor the batch schema.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode outbound payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Transport error ({context}): {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to load configuration: {0}")]
    ConfigSource(#[from] ConfigError),

    #[error("Message queue closed")]
    QueueClosed,

    #[error("Invalid address '{0}'")]
    Address(String),
}

impl LighthouseError {
    /// Startup-scope errors terminate the process; everything else is local.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LighthouseError::Bind { .. }
                | LighthouseError::Config(_)
                | LighthouseError::ConfigSource(_)
                | LighthouseError::Address(_)
        )
    }

    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        LighthouseError::Transport { context: context.into(), source }
    }

    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        LighthouseError::Bind { addr: addr.to_string(), source }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        LighthouseError::Config(reason.into())
    }
}

impl From<io::Error> for LighthouseError {
    fn from(err: io::Error) -> Self {
        LighthouseError::transport("io", err)
    }
}

/// A frame that is valid JSON but matches no known message schema.
#[derive(Error, Debug)]
#[error("frame of {len} bytes matches neither beacon nor batch schema: {source}")]
pub struct DecodeError {
    pub len: usize,
    #[source]
    pub source: serde_json::Error,
}
