//! World persistence and chunk streaming for Tessera.
//!
//! - [`ChunkStore`] loads and saves chunks through the region layer on a
//!   worker pool, deduplicating concurrent loads and ordering writes per chunk.
//! - [`VisibilityTracker`] keeps one viewer's square view area and produces
//!   add/remove diffs as the viewer moves.
//! - [`StreamingBroadcaster`] turns those diffs into wire frames, serializing
//!   each loaded chunk once for every viewer waiting on it.
//! - [`ChunkStreamer`] ties the three together behind the calls a simulation
//!   thread makes.

pub mod broadcast;
pub mod chunk;
pub mod error;
pub mod protocol;
pub mod store;
pub mod streaming;
pub mod ticket;
pub mod visibility;

pub use broadcast::StreamingBroadcaster;
pub use chunk::Chunk;
pub use error::{StoreError, StreamError, TrackerError};
pub use protocol::{Frame, FrameKind, StreamMessage, ViewerConnection, PROTOCOL_VERSION};
pub use store::{ChunkStore, LoadResult, SaveResult, StoreConfig};
pub use streaming::{ChunkStreamer, StreamingConfig};
pub use ticket::{Ticket, WaiterId};
pub use visibility::{VisibilityDiff, VisibilityTracker};

use std::fmt;

/// Identifies one connected viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewerId(pub u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer#{}", self.0)
    }
}
