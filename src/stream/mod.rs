pub mod queue;
pub mod reassembler;

pub use queue::{MessageQueue, QueueConsumer, QueueProducer};
pub use reassembler::StreamReassembler;
