//! Per-viewer visibility tracking.
//!
//! A viewer sees the square of chunks within chessboard distance `radius` of
//! its center chunk. Every transition returns the chunks that entered and left
//! view. New chunks are listed in spiral order around the new center so the
//! nearest ones are requested first.

use hashbrown::HashSet;
use tessera_core::{spiral, ChunkPos};
use tracing::trace;

use crate::error::TrackerError;

/// Chunks that entered and left a viewer's view in one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityDiff {
    /// Newly visible chunks, nearest to the center first.
    pub added: Vec<ChunkPos>,
    /// Chunks no longer visible.
    pub removed: Vec<ChunkPos>,
}

impl VisibilityDiff {
    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct View {
    center: ChunkPos,
    radius: u32,
}

impl View {
    fn contains(self, pos: ChunkPos) -> bool {
        pos.chebyshev_distance(self.center) <= self.radius
    }

    fn chunks(self) -> spiral::Spiral {
        spiral::square(self.center, self.radius)
    }
}

/// Tracks which chunks one viewer can see.
///
/// Starts detached. [`attach`](Self::attach) moves it to attached and
/// [`detach`](Self::detach) back; the other transitions require it to be
/// attached.
#[derive(Debug, Clone, Default)]
pub struct VisibilityTracker {
    view: Option<View>,
    tracked: HashSet<ChunkPos>,
}

impl VisibilityTracker {
    /// Create a detached tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.view.is_some()
    }

    /// Current center chunk, if attached.
    pub fn center(&self) -> Option<ChunkPos> {
        self.view.map(|v| v.center)
    }

    /// Current view radius, if attached.
    pub fn radius(&self) -> Option<u32> {
        self.view.map(|v| v.radius)
    }

    /// Check if a chunk is currently tracked.
    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.tracked.contains(&pos)
    }

    /// Get the tracked set.
    pub fn tracked(&self) -> &HashSet<ChunkPos> {
        &self.tracked
    }

    /// Start tracking the square of `radius` around `center`.
    ///
    /// Every chunk in the square is returned as added, in spiral order.
    pub fn attach(&mut self, center: ChunkPos, radius: u32) -> Result<VisibilityDiff, TrackerError> {
        if self.view.is_some() {
            return Err(TrackerError::AlreadyAttached);
        }
        let view = View { center, radius };
        let added: Vec<ChunkPos> = view.chunks().collect();
        self.tracked = added.iter().copied().collect();
        self.view = Some(view);
        trace!(%center, radius, added = added.len(), "viewer attached");
        Ok(VisibilityDiff {
            added,
            removed: Vec::new(),
        })
    }

    /// Move the view to a new center, keeping the radius.
    pub fn recenter(&mut self, center: ChunkPos) -> Result<VisibilityDiff, TrackerError> {
        let view = self.view.ok_or(TrackerError::NotAttached)?;
        Ok(self.transition(View { center, ..view }))
    }

    /// Change the radius, keeping the center.
    pub fn set_radius(&mut self, radius: u32) -> Result<VisibilityDiff, TrackerError> {
        let view = self.view.ok_or(TrackerError::NotAttached)?;
        Ok(self.transition(View { radius, ..view }))
    }

    /// Change center and radius together, producing a single diff against the final pair.
    pub fn update(&mut self, center: ChunkPos, radius: u32) -> Result<VisibilityDiff, TrackerError> {
        if self.view.is_none() {
            return Err(TrackerError::NotAttached);
        }
        Ok(self.transition(View { center, radius }))
    }

    /// Stop tracking. Every tracked chunk is returned as removed, in spiral order.
    pub fn detach(&mut self) -> Result<VisibilityDiff, TrackerError> {
        let view = self.view.take().ok_or(TrackerError::NotAttached)?;
        let removed: Vec<ChunkPos> = view.chunks().collect();
        self.tracked.clear();
        trace!(center = %view.center, removed = removed.len(), "viewer detached");
        Ok(VisibilityDiff {
            added: Vec::new(),
            removed,
        })
    }

    fn transition(&mut self, next: View) -> VisibilityDiff {
        let Some(current) = self.view else {
            return VisibilityDiff::default();
        };
        // Same chunk and radius: the common case, decided without touching the set.
        if current == next {
            return VisibilityDiff::default();
        }

        let added: Vec<ChunkPos> = next.chunks().filter(|&pos| !current.contains(pos)).collect();
        let removed: Vec<ChunkPos> = current.chunks().filter(|&pos| !next.contains(pos)).collect();

        for pos in &removed {
            self.tracked.remove(pos);
        }
        self.tracked.extend(added.iter().copied());
        self.view = Some(next);

        trace!(
            center = %next.center,
            radius = next.radius,
            added = added.len(),
            removed = removed.len(),
            "view changed"
        );
        VisibilityDiff { added, removed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(positions: &[(i32, i32)]) -> HashSet<ChunkPos> {
        positions.iter().map(|&p| ChunkPos::from(p)).collect()
    }

    fn attached(center: (i32, i32), radius: u32) -> VisibilityTracker {
        let mut tracker = VisibilityTracker::new();
        tracker.attach(center.into(), radius).unwrap();
        tracker
    }

    #[test]
    fn attach_tracks_full_square_in_spiral_order() {
        for radius in 0..6 {
            let center = ChunkPos::new(-100, 37);
            let mut tracker = VisibilityTracker::new();
            let diff = tracker.attach(center, radius).unwrap();

            assert_eq!(diff.added.len(), spiral::area(radius));
            assert_eq!(tracker.tracked().len(), spiral::area(radius));
            assert!(diff.removed.is_empty());
            assert_eq!(diff.added[0], center);
            assert!(diff
                .added
                .iter()
                .all(|pos| pos.chebyshev_distance(center) <= radius));
            assert!(diff
                .added
                .windows(2)
                .all(|w| w[0].chebyshev_distance(center) <= w[1].chebyshev_distance(center)));
        }
    }

    #[test]
    fn recenter_by_one_chunk() {
        let mut tracker = attached((0, 0), 1);
        assert_eq!(tracker.tracked(), &set(&[
            (-1, -1), (0, -1), (1, -1),
            (-1, 0), (0, 0), (1, 0),
            (-1, 1), (0, 1), (1, 1),
        ]));

        let diff = tracker.recenter(ChunkPos::new(1, 0)).unwrap();
        let added: HashSet<_> = diff.added.iter().copied().collect();
        let removed: HashSet<_> = diff.removed.iter().copied().collect();
        assert_eq!(added, set(&[(2, -1), (2, 0), (2, 1)]));
        assert_eq!(removed, set(&[(-1, -1), (-1, 0), (-1, 1)]));
        assert_eq!(diff.added.len(), 3);
        assert_eq!(diff.removed.len(), 3);
    }

    #[test]
    fn recenter_diffs_obey_set_laws() {
        let mut tracker = attached((0, 0), 3);
        let path = [(1, 0), (1, 0), (5, 2), (-4, -4), (-4, 3), (20, 20), (19, 21), (0, 0)];
        for center in path {
            let before = tracker.tracked().clone();
            let diff = tracker.recenter(center.into()).unwrap();
            let after = tracker.tracked().clone();

            assert!(diff.added.iter().all(|pos| !before.contains(pos)));
            assert!(diff.removed.iter().all(|pos| before.contains(pos)));
            let mut expected = before.clone();
            expected.extend(diff.added.iter().copied());
            for pos in &diff.removed {
                expected.remove(pos);
            }
            assert_eq!(after, expected);
            assert_eq!(after, spiral::square(center.into(), 3).collect::<HashSet<_>>());
        }
    }

    #[test]
    fn recenter_to_same_chunk_is_empty() {
        let mut tracker = attached((3, 3), 4);
        assert!(!tracker.recenter(ChunkPos::new(4, 3)).unwrap().is_empty());
        assert!(tracker.recenter(ChunkPos::new(4, 3)).unwrap().is_empty());
        assert!(tracker.set_radius(4).unwrap().is_empty());
    }

    #[test]
    fn radius_changes_grow_and_shrink_the_ring() {
        let mut tracker = attached((0, 0), 1);
        let grown = tracker.set_radius(2).unwrap();
        assert_eq!(grown.added.len(), 16);
        assert!(grown.removed.is_empty());
        assert!(grown.added.iter().all(|p| p.chebyshev_distance(ChunkPos::default()) == 2));

        let shrunk = tracker.set_radius(0).unwrap();
        assert_eq!(shrunk.removed.len(), 24);
        assert_eq!(tracker.tracked(), &set(&[(0, 0)]));
    }

    #[test]
    fn combined_update_is_one_diff_against_final_view() {
        let mut tracker = attached((0, 0), 2);
        let before = tracker.tracked().clone();
        let diff = tracker.update(ChunkPos::new(3, 0), 1).unwrap();

        let expected_added: HashSet<_> = spiral::square(ChunkPos::new(3, 0), 1)
            .filter(|p| !before.contains(p))
            .collect();
        assert_eq!(diff.added.iter().copied().collect::<HashSet<_>>(), expected_added);
        assert_eq!(diff.added.len(), 6);
        assert_eq!(diff.removed.len(), 25 - 3);
        assert_eq!(tracker.center(), Some(ChunkPos::new(3, 0)));
        assert_eq!(tracker.radius(), Some(1));
    }

    #[test]
    fn detach_removes_everything() {
        let mut tracker = attached((5, -5), 2);
        let diff = tracker.detach().unwrap();
        assert_eq!(diff.removed.len(), 25);
        assert!(diff.added.is_empty());
        assert!(!tracker.is_attached());
        assert!(tracker.tracked().is_empty());
    }

    #[test]
    fn transitions_check_state() {
        let mut tracker = VisibilityTracker::new();
        assert_eq!(tracker.recenter(ChunkPos::new(1, 1)), Err(TrackerError::NotAttached));
        assert_eq!(tracker.set_radius(3), Err(TrackerError::NotAttached));
        assert_eq!(tracker.detach(), Err(TrackerError::NotAttached));
        tracker.attach(ChunkPos::default(), 1).unwrap();
        assert_eq!(
            tracker.attach(ChunkPos::default(), 1),
            Err(TrackerError::AlreadyAttached)
        );
    }

    #[test]
    fn far_jump_replaces_whole_view() {
        let mut tracker = attached((0, 0), 2);
        let diff = tracker.recenter(ChunkPos::new(1000, -1000)).unwrap();
        assert_eq!(diff.added.len(), 25);
        assert_eq!(diff.removed.len(), 25);
        assert_eq!(diff.added[0], ChunkPos::new(1000, -1000));
        assert_eq!(diff.removed[0], ChunkPos::new(0, 0));
    }
}
