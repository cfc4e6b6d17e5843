//! Location and timestamp tables stored in the first two sectors.

use tessera_core::constants::{REGION_SLOTS, SECTOR_SIZE};

use crate::sector::SectorRange;

/// Size of the on-disk header in bytes.
pub const HEADER_BYTES: usize = 2 * SECTOR_SIZE;

/// In-memory copy of a region header.
///
/// Both tables are big-endian `u32` arrays indexed by slot. A location entry
/// is `offset << 8 | count`; a timestamp is seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeader {
    locations: Box<[u32]>,
    timestamps: Box<[u32]>,
}

impl Default for RegionHeader {
    fn default() -> Self {
        Self::empty()
    }
}

impl RegionHeader {
    pub fn empty() -> Self {
        Self {
            locations: vec![0; REGION_SLOTS].into_boxed_slice(),
            timestamps: vec![0; REGION_SLOTS].into_boxed_slice(),
        }
    }

    /// Parse a header from its first [`HEADER_BYTES`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut header = Self::empty();
        let (locations, timestamps) = bytes[..HEADER_BYTES].split_at(SECTOR_SIZE);
        for (slot, word) in header.locations.iter_mut().zip(locations.chunks_exact(4)) {
            *slot = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        }
        for (slot, word) in header.timestamps.iter_mut().zip(timestamps.chunks_exact(4)) {
            *slot = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        }
        header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_BYTES);
        for entry in self.locations.iter().chain(self.timestamps.iter()) {
            bytes.extend_from_slice(&entry.to_be_bytes());
        }
        bytes
    }

    #[inline]
    pub fn location(&self, index: usize) -> Option<SectorRange> {
        SectorRange::from_entry(self.locations[index])
    }

    #[inline]
    pub fn set_location(&mut self, index: usize, range: Option<SectorRange>) {
        self.locations[index] = range.map_or(0, SectorRange::to_entry);
    }

    #[inline]
    pub fn timestamp(&self, index: usize) -> u32 {
        self.timestamps[index]
    }

    #[inline]
    pub fn set_timestamp(&mut self, index: usize, seconds: u32) {
        self.timestamps[index] = seconds;
    }

    /// Clear a slot's location and timestamp.
    pub fn clear(&mut self, index: usize) {
        self.locations[index] = 0;
        self.timestamps[index] = 0;
    }

    /// Slots that currently have a location.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, SectorRange)> + '_ {
        self.locations
            .iter()
            .enumerate()
            .filter_map(|(index, &entry)| SectorRange::from_entry(entry).map(|range| (index, range)))
    }

    /// File offset of a slot's location entry
    #[inline]
    pub const fn location_offset(index: usize) -> u64 {
        (index * 4) as u64
    }

    /// File offset of a slot's timestamp entry
    #[inline]
    pub const fn timestamp_offset(index: usize) -> u64 {
        (SECTOR_SIZE + index * 4) as u64
    }
}
