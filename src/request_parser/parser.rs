use bytes::Bytes;
use serde::Deserialize;

use crate::error::{DecodeError, LighthouseError, Result};
use crate::generic_types::{BatchMessage, BeaconMessage, DecodedMessage};

/// Encode/decode of beacon payloads. Swappable so framing, queueing and
/// broadcast never depend on a particular JSON library.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, DecodeError>;

    fn encode_single(&self, message: &BeaconMessage) -> Result<Bytes>;

    fn encode_batch(&self, batch: &BatchMessage) -> Result<Bytes>;

    fn encode(&self, message: &DecodedMessage) -> Result<Bytes> {
        match message {
            DecodedMessage::Single(single) => self.encode_single(single),
            DecodedMessage::Batch(batch) => self.encode_batch(batch),
        }
    }
}

// Variant order matters: the single schema is tried before the batch schema.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMessage {
    Single(BeaconMessage),
    Batch(BatchMessage),
}

/// serde_json backed codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        JsonCodec
    }
}

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, DecodeError> {
        let raw: RawMessage =
            serde_json::from_slice(bytes).map_err(|source| DecodeError { len: bytes.len(), source })?;

        Ok(match raw {
            RawMessage::Single(single) => DecodedMessage::Single(single),
            RawMessage::Batch(batch) => DecodedMessage::Batch(batch),
        })
    }

    fn encode_single(&self, message: &BeaconMessage) -> Result<Bytes> {
        serde_json::to_vec(message).map(Bytes::from).map_err(LighthouseError::Encode)
    }

    fn encode_batch(&self, batch: &BatchMessage) -> Result<Bytes> {
        serde_json::to_vec(batch).map(Bytes::from).map_err(LighthouseError::Encode)
    }
}
