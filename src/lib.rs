//! Beacon telemetry ingest and broadcast.
//!
//! Inbound connections carry a raw stream of JSON beacon objects with no
//! length prefix. Each connection gets its own [`StreamReassembler`] that cuts
//! complete objects out of arbitrarily chunked reads; the frames go through a
//! bounded [`MessageQueue`] to a [`ParserPool`] that decodes them and feeds
//! [`RunningStats`]. Independently, a heartbeat source (optionally joined by
//! relayed inbound records) is batched by the [`BatchAssembler`] and fanned out
//! by the [`Broadcaster`] to every subscriber in the [`ListenerRegistry`].
//!
//! ```rust,no_run
//! use rs_lighthouse::{Config, Lighthouse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Lighthouse::bind(Config::default()).await?;
//!     let cancel = server.cancel_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         cancel.cancel();
//!     });
//!     let stats = server.run().await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod generic_types;
pub mod logging;
pub mod options;
pub mod request_parser;
pub mod server;
pub mod stats;
pub mod stream;

pub use broadcast::{BatchAssembler, BeaconSource, Broadcaster, ListenerRegistry, OutboundBatch, OutboundSink};
pub use config::{BroadcastMode, Config};
pub use error::{LighthouseError, Result};
pub use generic_types::{BatchMessage, BeaconMessage, ConnectionId, DecodedMessage, Frame};
pub use options::Options;
pub use request_parser::{Codec, JsonCodec, ParserPool};
pub use server::Lighthouse;
pub use stats::{RunningStats, StatsSnapshot};
pub use stream::{MessageQueue, StreamReassembler};
