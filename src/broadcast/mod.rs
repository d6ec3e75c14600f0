pub mod batch;
pub mod beacon;
pub mod broadcaster;
pub mod registry;

pub use batch::{BatchAssembler, OutboundBatch};
pub use beacon::BeaconSource;
pub use broadcaster::{BroadcastReport, Broadcaster, OutboundSink};
pub use registry::{ListenerRegistry, Peer, PeerId};
