//! Coordinate systems for chunk columns and region files.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{REGION_BITS, REGION_SIZE};

/// Chunk column position in chunk coordinates.
///
/// Ordering is lexicographic on `(x, z)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    /// Create a new chunk position
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Pack into a single 64-bit key: `x` in the high half, `z` in the low half.
    #[inline]
    pub const fn pack(self) -> i64 {
        ((self.x as i64) << 32) | (self.z as i64 & 0xFFFF_FFFF)
    }

    /// Inverse of [`ChunkPos::pack`]
    #[inline]
    pub const fn unpack(key: i64) -> Self {
        Self::new((key >> 32) as i32, key as i32)
    }

    /// Region containing this chunk
    #[inline]
    pub const fn region(self) -> RegionPos {
        RegionPos::new(self.x >> REGION_BITS, self.z >> REGION_BITS)
    }

    /// Position within the owning region, floor-mod 32 on each axis.
    #[inline]
    pub const fn local(self) -> (u32, u32) {
        let size = REGION_SIZE as i32;
        (
            self.x.rem_euclid(size) as u32,
            self.z.rem_euclid(size) as u32,
        )
    }

    /// Index of this chunk's slot in a region header (`local_x + local_z * 32`)
    #[inline]
    pub const fn local_index(self) -> usize {
        let (lx, lz) = self.local();
        lx as usize + lz as usize * REGION_SIZE
    }

    /// Offset by a number of chunks on each axis
    #[inline]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x.wrapping_add(dx), self.z.wrapping_add(dz))
    }

    /// Chessboard distance: the larger of the per-axis distances.
    #[inline]
    pub const fn chebyshev_distance(self, other: Self) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dz = (self.z as i64 - other.z as i64).unsigned_abs();
        (if dx > dz { dx } else { dz }) as u32
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

impl From<(i32, i32)> for ChunkPos {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}

/// Region position: one region file covers 32x32 chunk columns.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    /// Create a new region position
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk at the minimum corner of this region
    #[inline]
    pub const fn min_chunk(self) -> ChunkPos {
        ChunkPos::new(self.x << REGION_BITS, self.z << REGION_BITS)
    }

    /// Check whether a chunk falls inside this region
    #[inline]
    pub const fn contains(self, chunk: ChunkPos) -> bool {
        let region = chunk.region();
        region.x == self.x && region.z == self.z
    }

    /// On-disk file name, `r.<x>.<z>.<ext>`
    pub fn file_name(self, extension: &str) -> String {
        format!("r.{}.{}.{}", self.x, self.z, extension)
    }

    /// Parse a region file name produced by [`RegionPos::file_name`].
    ///
    /// The extension is not checked.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let mut parts = name.split('.');
        if parts.next()? != "r" {
            return None;
        }
        let x = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, z))
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r.{}.{}", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip_extremes() {
        let values = [i32::MIN, -33, -32, -1, 0, 1, 31, 32, i32::MAX];
        for &x in &values {
            for &z in &values {
                let pos = ChunkPos::new(x, z);
                assert_eq!(ChunkPos::unpack(pos.pack()), pos);
            }
        }
    }

    #[test]
    fn pack_layout_matches_key_format() {
        assert_eq!(ChunkPos::new(1, 2).pack(), (1_i64 << 32) | 2);
        assert_eq!(ChunkPos::new(0, -1).pack(), 0xFFFF_FFFF);
        assert_eq!(ChunkPos::new(-1, 0).pack(), -1_i64 << 32);
    }

    #[test]
    fn negative_chunks_map_to_floor_region() {
        assert_eq!(ChunkPos::new(-1, -1).region(), RegionPos::new(-1, -1));
        assert_eq!(ChunkPos::new(-32, 31).region(), RegionPos::new(-1, 0));
        assert_eq!(ChunkPos::new(-33, 32).region(), RegionPos::new(-2, 1));
    }

    #[test]
    fn local_uses_positive_modulo() {
        assert_eq!(ChunkPos::new(-1, -1).local(), (31, 31));
        assert_eq!(ChunkPos::new(-32, 33).local(), (0, 1));
        assert_eq!(ChunkPos::new(5, 6).local_index(), 5 + 6 * 32);
        assert_eq!(ChunkPos::new(-1, 0).local_index(), 31);
    }

    #[test]
    fn region_contains_its_min_chunk() {
        let region = RegionPos::new(-3, 7);
        assert!(region.contains(region.min_chunk()));
        assert!(region.contains(region.min_chunk().offset(31, 31)));
        assert!(!region.contains(region.min_chunk().offset(32, 0)));
    }

    #[test]
    fn file_name_roundtrip() {
        let region = RegionPos::new(-2, 15);
        let name = region.file_name("mca");
        assert_eq!(name, "r.-2.15.mca");
        assert_eq!(RegionPos::parse_file_name(&name), Some(region));
        assert_eq!(RegionPos::parse_file_name("c.1.2.mcc"), None);
        assert_eq!(RegionPos::parse_file_name("r.1.mca"), None);
    }

    #[test]
    fn chebyshev_distance_is_max_axis() {
        let a = ChunkPos::new(0, 0);
        assert_eq!(a.chebyshev_distance(ChunkPos::new(3, -1)), 3);
        assert_eq!(a.chebyshev_distance(ChunkPos::new(-2, 5)), 5);
        assert_eq!(
            ChunkPos::new(i32::MIN, 0).chebyshev_distance(ChunkPos::new(i32::MAX, 0)),
            u32::MAX
        );
    }

    #[test]
    fn ordering_is_x_then_z() {
        let mut positions = vec![
            ChunkPos::new(1, 0),
            ChunkPos::new(0, 5),
            ChunkPos::new(0, -5),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![ChunkPos::new(0, -5), ChunkPos::new(0, 5), ChunkPos::new(1, 0)]
        );
    }
}
