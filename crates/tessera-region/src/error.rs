//! Error types for region file access.

use std::path::PathBuf;

use thiserror::Error;

use crate::compression::CompressionScheme;

/// Errors raised while reading or writing a region file.
#[derive(Error, Debug)]
pub enum RegionError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The location/timestamp tables could not be trusted
    #[error("corrupt region header in {}: {reason}", path.display())]
    CorruptHeader { path: PathBuf, reason: String },

    /// One slot's stored payload is malformed
    #[error("corrupt entry in slot {index}: {reason}")]
    CorruptEntry { index: usize, reason: String },

    /// A payload is larger than the configured maximum chunk size.
    ///
    /// When raised during decompression `size` is the number of bytes produced
    /// before giving up, not the full size.
    #[error("chunk payload exceeds the {limit} byte limit ({size} bytes)")]
    CapacityExceeded { limit: usize, size: usize },

    /// No contiguous sector run is addressable by the 24-bit location table
    #[error("region file {} has no addressable sectors left", path.display())]
    Full { path: PathBuf },

    /// The file was opened for inspection and refuses writes
    #[error("region file {} is open read-only", path.display())]
    ReadOnly { path: PathBuf },
}

impl RegionError {
    /// Whether this error describes bad on-disk data rather than a failed operation.
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptEntry { .. } | Self::CapacityExceeded { .. })
    }
}

/// Errors raised while decoding a compressed payload.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("malformed {scheme} stream: {source}")]
    Malformed {
        scheme: CompressionScheme,
        source: std::io::Error,
    },

    #[error("decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Result type alias using [`RegionError`].
pub type Result<T> = std::result::Result<T, RegionError>;
