//! Region file storage for chunk columns.
//!
//! A region file holds a fixed 32x32 grid of chunk slots. The first two
//! 4 KiB sectors hold the location and timestamp tables; every chunk payload
//! after that is stored in a contiguous run of whole sectors, compressed with
//! one of the [`CompressionScheme`]s.
//!
//! [`RegionCache`] bounds the number of open region files and hands out
//! shared, individually locked handles to them.

pub mod cache;
pub mod compression;
pub mod error;
pub mod header;
pub mod region_file;
pub mod sector;

pub use cache::{RegionCache, RegionHandle};
pub use compression::CompressionScheme;
pub use error::{PayloadError, RegionError, Result};
pub use header::RegionHeader;
pub use region_file::{RegionFile, RegionOptions};
pub use sector::{SectorBitmap, SectorRange};
