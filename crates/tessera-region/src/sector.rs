//! Sector ranges and the in-memory sector allocation map.

use bitvec::prelude::*;
use tessera_core::constants::{HEADER_SECTORS, SECTOR_SIZE};

/// Largest sector offset addressable by a 24-bit location entry.
pub const MAX_SECTOR_OFFSET: u32 = 0x00FF_FFFF;

/// Largest sector count storable in the low byte of a location entry.
pub const MAX_SECTOR_COUNT: u32 = 0xFF;

/// Contiguous run of sectors, in sector units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectorRange {
    pub offset: u32,
    pub count: u32,
}

impl SectorRange {
    #[inline]
    pub const fn new(offset: u32, count: u32) -> Self {
        Self { offset, count }
    }

    /// Decode a location table entry (`offset << 8 | count`). Zero means absent.
    #[inline]
    pub const fn from_entry(entry: u32) -> Option<Self> {
        if entry == 0 {
            None
        } else {
            Some(Self::new(entry >> 8, entry & MAX_SECTOR_COUNT))
        }
    }

    /// Encode as a location table entry.
    #[inline]
    pub const fn to_entry(self) -> u32 {
        (self.offset << 8) | (self.count & MAX_SECTOR_COUNT)
    }

    /// One past the last sector
    #[inline]
    pub const fn end(self) -> u32 {
        self.offset + self.count
    }

    #[inline]
    pub const fn byte_offset(self) -> u64 {
        self.offset as u64 * SECTOR_SIZE as u64
    }

    #[inline]
    pub const fn byte_len(self) -> usize {
        self.count as usize * SECTOR_SIZE
    }

    /// Whether two ranges share at least one sector.
    #[inline]
    pub const fn overlaps(self, other: Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Number of whole sectors needed to hold `bytes`.
#[inline]
pub const fn sectors_for(bytes: usize) -> u32 {
    bytes.div_ceil(SECTOR_SIZE) as u32
}

/// Tracks which sectors of a region file are in use.
///
/// The two header sectors are always marked used. Allocation is first-fit and
/// grows the map past the current end of file when no gap is large enough.
#[derive(Debug, Clone)]
pub struct SectorBitmap {
    used: BitVec,
}

impl Default for SectorBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorBitmap {
    pub fn new() -> Self {
        let mut used = BitVec::new();
        used.resize(HEADER_SECTORS, true);
        Self { used }
    }

    /// Number of sectors the map covers
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Number of sectors currently marked used, header included.
    pub fn used_count(&self) -> usize {
        self.used.count_ones()
    }

    /// Extend the map with free sectors so it covers at least `sectors`.
    pub fn grow_to(&mut self, sectors: usize) {
        if sectors > self.used.len() {
            self.used.resize(sectors, false);
        }
    }

    /// Whether every sector in `range` is unused.
    pub fn is_free(&self, range: SectorRange) -> bool {
        let start = (range.offset as usize).min(self.used.len());
        let end = (range.end() as usize).min(self.used.len());
        self.used[start..end].not_any()
    }

    /// Mark a range as used.
    pub fn reserve(&mut self, range: SectorRange) {
        let end = range.end() as usize;
        if end > self.used.len() {
            self.used.resize(end, false);
        }
        self.used[range.offset as usize..end].fill(true);
    }

    /// Mark a range as unused. The header sectors are never released.
    pub fn release(&mut self, range: SectorRange) {
        let start = (range.offset as usize).max(HEADER_SECTORS).min(self.used.len());
        let end = (range.end() as usize).min(self.used.len());
        if start < end {
            self.used[start..end].fill(false);
        }
    }

    /// Reserve the first run of `count` free sectors.
    pub fn allocate(&mut self, count: u32) -> SectorRange {
        let wanted = count as usize;
        let len = self.used.len();
        let mut cursor = 0;
        loop {
            let gap_start = self.used[cursor..].first_zero().map_or(len, |i| cursor + i);
            let gap_end = if gap_start >= len {
                usize::MAX
            } else {
                self.used[gap_start..].first_one().map_or(usize::MAX, |i| gap_start + i)
            };
            if gap_end - gap_start >= wanted {
                let range = SectorRange::new(gap_start as u32, count);
                self.reserve(range);
                return range;
            }
            cursor = gap_end;
        }
    }
}
