//! Core types for the Tessera world store.
//!
//! This crate provides the foundational types shared by the storage and
//! streaming layers:
//! - Chunk and region coordinates with their packed and on-disk forms
//! - Spiral enumeration of square view areas
//! - Common error types

pub mod coords;
pub mod error;
pub mod spiral;

pub use coords::{ChunkPos, RegionPos};
pub use error::{Error, Result};

/// Storage-wide constants
pub mod constants {
    /// Chunks per region edge
    pub const REGION_SIZE: usize = 32;
    /// Bits needed to address a chunk within a region (5 bits for 0-31)
    pub const REGION_BITS: u32 = 5;
    /// Chunk slots in one region file (32^2)
    pub const REGION_SLOTS: usize = REGION_SIZE * REGION_SIZE;
    /// Size of one region file sector in bytes
    pub const SECTOR_SIZE: usize = 4096;
    /// Sectors occupied by the location and timestamp tables
    pub const HEADER_SECTORS: usize = 2;
    /// Default upper bound on a decompressed chunk payload
    pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;
}
