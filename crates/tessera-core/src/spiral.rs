//! Square spiral enumeration around a center chunk.
//!
//! Index 0 is the center. Ring `r` (the chunks at chessboard distance `r`)
//! occupies indices `(2r-1)^2 .. (2r+1)^2`, walked clockwise starting just
//! right of the ring's top-left corner and ending on that corner. Enumerating
//! the first `(2r+1)^2` indices therefore covers exactly the square of
//! radius `r`, nearest rings first.

use std::iter::FusedIterator;

use crate::coords::ChunkPos;

/// Number of chunks in the square of the given radius, `(2r+1)^2`.
#[inline]
pub const fn area(radius: u32) -> usize {
    let side = 2 * radius as usize + 1;
    side * side
}

/// Offset from the center of the chunk at `index` in the spiral.
pub fn offset(index: usize) -> (i32, i32) {
    if index == 0 {
        return (0, 0);
    }

    let ring = (isqrt(index) + 1) / 2;
    let inner = (2 * ring - 1) * (2 * ring - 1);
    let edge = 2 * ring;
    let k = index - inner;
    let side = k / edge;
    let t = (k % edge) as i64;
    let r = ring as i64;

    let (dx, dz) = match side {
        0 => (-r + 1 + t, -r),
        1 => (r, -r + 1 + t),
        2 => (r - 1 - t, r),
        _ => (-r, r - 1 - t),
    };
    (dx as i32, dz as i32)
}

/// Iterate the square of `radius` around `center` in spiral order.
pub fn square(center: ChunkPos, radius: u32) -> Spiral {
    Spiral {
        center,
        next: 0,
        end: area(radius),
    }
}

/// Iterator returned by [`square`].
#[derive(Debug, Clone)]
pub struct Spiral {
    center: ChunkPos,
    next: usize,
    end: usize,
}

impl Iterator for Spiral {
    type Item = ChunkPos;

    fn next(&mut self) -> Option<ChunkPos> {
        if self.next >= self.end {
            return None;
        }
        let (dx, dz) = offset(self.next);
        self.next += 1;
        Some(self.center.offset(dx, dz))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Spiral {}

impl FusedIterator for Spiral {}

fn isqrt(n: usize) -> usize {
    let mut root = (n as f64).sqrt() as usize;
    while root * root > n {
        root -= 1;
    }
    while (root + 1).checked_mul(root + 1).is_some_and(|sq| sq <= n) {
        root += 1;
    }
    root
}
