//! Error types for the chunk store and streaming layers.

use tessera_core::ChunkPos;
use tessera_region::RegionError;
use thiserror::Error;

use crate::ViewerId;

/// Per-chunk failure delivered through a [`Ticket`](crate::Ticket).
///
/// Cloneable so one failed load can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored bytes for this chunk cannot be decoded
    #[error("chunk {pos} is corrupt: {reason}")]
    Corrupt { pos: ChunkPos, reason: String },

    /// The chunk is larger than the configured maximum
    #[error("chunk {pos} exceeds the {limit} byte limit")]
    CapacityExceeded { pos: ChunkPos, limit: usize },

    /// Filesystem failure that persisted through every retry
    #[error("I/O failure for chunk {pos} after {attempts} attempt(s): {message}")]
    Io {
        pos: ChunkPos,
        attempts: u32,
        message: String,
    },

    /// Flushing region headers failed
    #[error("failed to flush region files: {0}")]
    Flush(String),

    /// The waiter was removed before the operation finished
    #[error("operation was cancelled")]
    Cancelled,

    /// The store no longer accepts work
    #[error("chunk store is shut down")]
    ShutDown,
}

impl StoreError {
    /// Convert a region error raised for `pos` after `attempts` tries.
    pub fn from_region(pos: ChunkPos, error: RegionError, attempts: u32) -> Self {
        match error {
            RegionError::CorruptEntry { reason, .. } => Self::Corrupt { pos, reason },
            RegionError::CapacityExceeded { limit, .. } => Self::CapacityExceeded { pos, limit },
            other => Self::Io {
                pos,
                attempts,
                message: other.to_string(),
            },
        }
    }

    /// Chunk the failure belongs to, if any.
    pub const fn pos(&self) -> Option<ChunkPos> {
        match self {
            Self::Corrupt { pos, .. } | Self::CapacityExceeded { pos, .. } | Self::Io { pos, .. } => {
                Some(*pos)
            }
            Self::Flush(_) | Self::Cancelled | Self::ShutDown => None,
        }
    }

    /// Whether the chunk's stored data is bad, as opposed to the store failing.
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::CapacityExceeded { .. })
    }
}

/// Invalid [`VisibilityTracker`](crate::VisibilityTracker) transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    #[error("viewer is already attached")]
    AlreadyAttached,

    #[error("viewer is not attached")]
    NotAttached,
}

/// Errors from the streaming layer.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("{0} is not attached")]
    UnknownViewer(ViewerId),

    #[error("{0} is already attached")]
    DuplicateViewer(ViewerId),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("stream message codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
