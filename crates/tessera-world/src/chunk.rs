//! Chunk records as stored in region slots.

use serde::{Deserialize, Serialize};
use tessera_core::{ChunkPos, Error, Result};

/// A chunk column as persisted by the store.
///
/// The payload is opaque to this crate; the simulation owns its format and
/// bumps `data_version` when that format changes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position the chunk was saved at.
    pub pos: ChunkPos,
    /// Version of the payload format.
    pub data_version: u32,
    /// Simulation tick of the last modification.
    pub last_update: u64,
    /// Serialized chunk contents.
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Create a chunk with the given payload.
    pub fn new(pos: ChunkPos, payload: Vec<u8>) -> Self {
        Self {
            pos,
            data_version: 0,
            last_update: 0,
            payload,
        }
    }

    /// The value a load resolves with when nothing is stored at `pos`.
    pub fn empty(pos: ChunkPos) -> Self {
        Self::new(pos, Vec::new())
    }

    /// Check if the chunk carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode for storage in a region slot.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a record read from a region slot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::InvalidData(e.to_string()))
    }
}
