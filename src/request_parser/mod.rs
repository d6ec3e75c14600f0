pub mod parser;
pub mod pool;

pub use parser::{Codec, JsonCodec};
pub use pool::{ParserPool, PoolWorker};
