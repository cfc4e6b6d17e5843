//! Chunk streaming driven by viewer movement.

use std::sync::Arc;

use hashbrown::HashMap;
use tessera_core::ChunkPos;
use tracing::{debug, info};

use crate::broadcast::StreamingBroadcaster;
use crate::chunk::Chunk;
use crate::error::{StoreError, StreamError};
use crate::protocol::ViewerConnection;
use crate::store::ChunkStore;
use crate::ticket::Ticket;
use crate::visibility::{VisibilityDiff, VisibilityTracker};
use crate::ViewerId;

/// Configuration for chunk streaming behavior.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// View radius in chunks when a viewer does not ask for one.
    pub default_view_radius: u32,
    /// Largest view radius a viewer may request. Larger requests are clamped.
    pub max_view_radius: u32,
    /// Maximum frames delivered per update call.
    pub max_sends_per_update: usize,
    /// Release unwatched resident chunks every this many updates. Zero disables it.
    pub release_interval: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            default_view_radius: 8,
            max_view_radius: 32,
            max_sends_per_update: usize::MAX,
            release_interval: 20,
        }
    }
}

/// Entry point for the simulation thread.
///
/// Owns one [`VisibilityTracker`] per viewer and feeds their diffs to a
/// [`StreamingBroadcaster`]. All methods return without waiting on disk;
/// [`update`](Self::update) delivers whatever finished loading since the last
/// call.
pub struct ChunkStreamer {
    config: StreamingConfig,
    store: Arc<ChunkStore>,
    trackers: HashMap<ViewerId, VisibilityTracker>,
    broadcaster: StreamingBroadcaster,
    /// Number of viewers tracking each chunk.
    watchers: HashMap<ChunkPos, u32>,
    /// Updates since the last automatic release.
    ticks_since_release: u32,
}

impl ChunkStreamer {
    /// Create a streamer serving chunks from `store`.
    pub fn new(config: StreamingConfig, store: Arc<ChunkStore>) -> Self {
        let broadcaster = StreamingBroadcaster::new(Arc::clone(&store), config.max_sends_per_update);
        Self {
            config,
            store,
            trackers: HashMap::new(),
            broadcaster,
            watchers: HashMap::new(),
            ticks_since_release: 0,
        }
    }

    /// Get the streaming configuration.
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Get the backing chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Get the broadcaster.
    pub fn broadcaster(&self) -> &StreamingBroadcaster {
        &self.broadcaster
    }

    fn clamp_radius(&self, viewer: ViewerId, radius: u32) -> u32 {
        if radius > self.config.max_view_radius {
            debug!(%viewer, radius, max = self.config.max_view_radius, "clamping view radius");
            self.config.max_view_radius
        } else {
            radius
        }
    }

    fn tracker_mut(&mut self, viewer: ViewerId) -> Result<&mut VisibilityTracker, StreamError> {
        self.trackers
            .get_mut(&viewer)
            .ok_or(StreamError::UnknownViewer(viewer))
    }

    /// Start streaming to a new viewer.
    ///
    /// The viewer receives its center first, then every chunk within
    /// `radius` (or the configured default) as loads complete, nearest first.
    pub fn request_attach(
        &mut self,
        viewer: ViewerId,
        center: ChunkPos,
        radius: Option<u32>,
        connection: Box<dyn ViewerConnection>,
    ) -> Result<VisibilityDiff, StreamError> {
        if self.trackers.contains_key(&viewer) {
            return Err(StreamError::DuplicateViewer(viewer));
        }
        let radius = self.clamp_radius(viewer, radius.unwrap_or(self.config.default_view_radius));

        let mut tracker = VisibilityTracker::new();
        let diff = tracker.attach(center, radius)?;
        self.trackers.insert(viewer, tracker);
        self.broadcaster.add_viewer(viewer, connection);
        self.broadcaster.send_center(viewer, center);
        self.apply(viewer, &diff);

        info!(%viewer, %center, radius, "viewer attached");
        Ok(diff)
    }

    /// Move a viewer. Only crossing into another chunk changes anything.
    pub fn request_recenter(
        &mut self,
        viewer: ViewerId,
        center: ChunkPos,
    ) -> Result<VisibilityDiff, StreamError> {
        let tracker = self.tracker_mut(viewer)?;
        let moved = tracker.center() != Some(center);
        let diff = tracker.recenter(center)?;
        if moved {
            self.broadcaster.send_center(viewer, center);
        }
        self.apply(viewer, &diff);
        Ok(diff)
    }

    /// Change a viewer's radius.
    pub fn request_set_radius(
        &mut self,
        viewer: ViewerId,
        radius: u32,
    ) -> Result<VisibilityDiff, StreamError> {
        let radius = self.clamp_radius(viewer, radius);
        let diff = self.tracker_mut(viewer)?.set_radius(radius)?;
        self.apply(viewer, &diff);
        Ok(diff)
    }

    /// Change a viewer's center and radius in one step.
    pub fn request_move(
        &mut self,
        viewer: ViewerId,
        center: ChunkPos,
        radius: u32,
    ) -> Result<VisibilityDiff, StreamError> {
        let radius = self.clamp_radius(viewer, radius);
        let tracker = self.tracker_mut(viewer)?;
        let moved = tracker.center() != Some(center);
        let diff = tracker.update(center, radius)?;
        if moved {
            self.broadcaster.send_center(viewer, center);
        }
        self.apply(viewer, &diff);
        Ok(diff)
    }

    /// Stop streaming to a viewer. Every tracked chunk is unloaded on its side.
    pub fn request_detach(&mut self, viewer: ViewerId) -> Result<VisibilityDiff, StreamError> {
        let mut tracker = self
            .trackers
            .remove(&viewer)
            .ok_or(StreamError::UnknownViewer(viewer))?;
        let diff = tracker.detach()?;
        self.apply(viewer, &diff);
        self.broadcaster.remove_viewer(viewer);
        info!(%viewer, unloaded = diff.removed.len(), "viewer detached");
        Ok(diff)
    }

    /// Removals go out before additions so a viewer never holds more than its view.
    fn apply(&mut self, viewer: ViewerId, diff: &VisibilityDiff) {
        for &pos in &diff.removed {
            if let Some(count) = self.watchers.get_mut(&pos) {
                *count -= 1;
                if *count == 0 {
                    self.watchers.remove(&pos);
                }
            }
            self.broadcaster.on_chunk_removed(pos, viewer);
        }
        for &pos in &diff.added {
            *self.watchers.entry(pos).or_insert(0) += 1;
            self.broadcaster.on_chunk_added(pos, viewer);
        }
    }

    /// Persist a chunk. Readers see it immediately.
    pub fn persist_chunk(&self, pos: ChunkPos, chunk: Chunk) -> Ticket<()> {
        self.store.save(pos, chunk)
    }

    /// Read a chunk through the store.
    pub fn read_chunk(&self, pos: ChunkPos) -> Ticket<Arc<Chunk>> {
        self.store.load(pos)
    }

    /// Deliver finished loads and run periodic maintenance.
    ///
    /// Every `release_interval` calls, resident chunks no viewer watches are
    /// released. Idle region files are closed on the store's workers, never on
    /// the calling thread. Call once per tick. Returns the number of frames sent.
    pub fn update(&mut self) -> usize {
        let sent = self.broadcaster.pump();
        if self.config.release_interval > 0 {
            self.ticks_since_release += 1;
            if self.ticks_since_release >= self.config.release_interval {
                self.ticks_since_release = 0;
                self.release_unwatched();
            }
        }
        self.store.evict_idle_regions();
        sent
    }

    /// Take the load failures seen since the last call.
    pub fn drain_failures(&mut self) -> Vec<(ChunkPos, StoreError)> {
        self.broadcaster.drain_failures()
    }

    /// Drop resident chunks no viewer is watching.
    ///
    /// Pending saves are still written first. Returns the number of unloads issued.
    pub fn release_unwatched(&self) -> usize {
        let mut released = 0;
        for pos in self.store.resident_positions() {
            if !self.watchers.contains_key(&pos) {
                drop(self.store.unload(pos));
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "released unwatched chunks");
        }
        released
    }

    /// Number of attached viewers.
    pub fn viewer_count(&self) -> usize {
        self.trackers.len()
    }

    /// Get a viewer's tracker.
    pub fn tracker(&self, viewer: ViewerId) -> Option<&VisibilityTracker> {
        self.trackers.get(&viewer)
    }

    /// Check if any viewer is tracking a chunk.
    pub fn is_watched(&self, pos: ChunkPos) -> bool {
        self.watchers.contains_key(&pos)
    }

    /// Number of chunk loads not yet delivered.
    pub fn in_flight_count(&self) -> usize {
        self.broadcaster.in_flight_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crossbeam::channel::{self, Receiver};
    use tessera_core::spiral;
    use tessera_region::{RegionFile, RegionOptions};
    use tessera_test::{init_tracing, TempDir};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use crate::protocol::{Frame, FrameKind, StreamMessage};
    use crate::store::StoreConfig;

    fn streamer(dir: &TempDir) -> ChunkStreamer {
        streamer_with(dir, StreamingConfig::default())
    }

    fn streamer_with(dir: &TempDir, config: StreamingConfig) -> ChunkStreamer {
        let store = ChunkStore::new(StoreConfig {
            worker_threads: 2,
            ..StoreConfig::new(dir.join("region"))
        });
        ChunkStreamer::new(config, Arc::new(store))
    }

    /// Records events from the region crate emitted on the current thread.
    #[derive(Clone, Default)]
    struct RegionEvents(Arc<parking_lot::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> Layer<S> for RegionEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let target = event.metadata().target();
            if target.starts_with("tessera_region") {
                self.0.lock().push(target.to_string());
            }
        }
    }

    fn attach(
        streamer: &mut ChunkStreamer,
        id: u64,
        center: (i32, i32),
        radius: u32,
    ) -> (ViewerId, Receiver<Frame>) {
        let (tx, rx) = channel::unbounded();
        let viewer = ViewerId(id);
        streamer
            .request_attach(viewer, center.into(), Some(radius), Box::new(tx))
            .unwrap();
        (viewer, rx)
    }

    fn settle(streamer: &mut ChunkStreamer) {
        for _ in 0..5000 {
            streamer.update();
            if streamer.in_flight_count() == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("loads did not finish");
    }

    fn frames(rx: &Receiver<Frame>) -> Vec<(FrameKind, ChunkPos)> {
        rx.try_iter().map(|f| (f.kind, f.pos)).collect()
    }

    fn render(received: &[(FrameKind, ChunkPos)]) -> String {
        received
            .iter()
            .map(|(kind, pos)| format!("{kind:?} {pos}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn attach_sends_center_then_spiral() {
        init_tracing();
        let dir = TempDir::new("stream-attach");
        let mut streamer = streamer(&dir);
        // Resident chunks resolve at once, so delivery follows request order.
        for pos in spiral::square(ChunkPos::new(0, 0), 1) {
            streamer.read_chunk(pos).wait().unwrap();
        }

        let (_, rx) = attach(&mut streamer, 1, (0, 0), 1);
        assert_eq!(frames(&rx), vec![(FrameKind::SetCenter, ChunkPos::new(0, 0))]);
        assert_eq!(streamer.update(), 9);
        insta::assert_snapshot!(render(&frames(&rx)), @r"
        ChunkData [0, 0]
        ChunkData [0, -1]
        ChunkData [1, -1]
        ChunkData [1, 0]
        ChunkData [1, 1]
        ChunkData [0, 1]
        ChunkData [-1, 1]
        ChunkData [-1, 0]
        ChunkData [-1, -1]
        ");
        assert!(streamer.is_watched(ChunkPos::new(1, 1)));
        assert!(!streamer.is_watched(ChunkPos::new(2, 1)));
    }

    #[test]
    fn center_goes_out_before_new_data() {
        let dir = TempDir::new("stream-recenter");
        let mut streamer = streamer(&dir);
        let (viewer, rx) = attach(&mut streamer, 1, (0, 0), 1);
        settle(&mut streamer);
        rx.try_iter().for_each(drop);

        let diff = streamer.request_recenter(viewer, ChunkPos::new(1, 0)).unwrap();
        assert_eq!(diff.added.len(), 3);
        settle(&mut streamer);

        let received = frames(&rx);
        assert_eq!(received[0], (FrameKind::SetCenter, ChunkPos::new(1, 0)));
        let unloads: Vec<ChunkPos> = received
            .iter()
            .filter(|(kind, _)| *kind == FrameKind::UnloadChunk)
            .map(|(_, pos)| *pos)
            .collect();
        let data: Vec<ChunkPos> = received
            .iter()
            .filter(|(kind, _)| *kind == FrameKind::ChunkData)
            .map(|(_, pos)| *pos)
            .collect();
        assert_eq!(unloads.len(), 3);
        assert!(unloads.iter().all(|pos| pos.x == -1));
        assert_eq!(data.len(), 3);
        assert!(data.iter().all(|pos| pos.x == 2));

        assert!(streamer.request_recenter(viewer, ChunkPos::new(1, 0)).unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_data_after_unload() {
        let dir = TempDir::new("stream-no-data-after-unload");
        let mut streamer = streamer(&dir);
        let (viewer, rx) = attach(&mut streamer, 1, (0, 0), 0);
        streamer.request_recenter(viewer, ChunkPos::new(5, 5)).unwrap();
        settle(&mut streamer);

        assert_eq!(
            frames(&rx),
            vec![
                (FrameKind::SetCenter, ChunkPos::new(0, 0)),
                (FrameKind::SetCenter, ChunkPos::new(5, 5)),
                (FrameKind::UnloadChunk, ChunkPos::new(0, 0)),
                (FrameKind::ChunkData, ChunkPos::new(5, 5)),
            ]
        );
    }

    #[test]
    fn overlapping_viewers_share_loads_and_encoding() {
        let dir = TempDir::new("stream-shared");
        let mut streamer = streamer(&dir);
        let (_, rx_a) = attach(&mut streamer, 1, (0, 0), 1);
        let (_, rx_b) = attach(&mut streamer, 2, (0, 0), 1);
        settle(&mut streamer);

        assert_eq!(streamer.broadcaster().chunks_encoded(), 9);
        assert_eq!(streamer.store().disk_reads(), 9);
        assert_eq!(frames(&rx_a).len(), 10);
        assert_eq!(frames(&rx_b).len(), 10);
    }

    #[test]
    fn combined_move_sends_one_diff() {
        let dir = TempDir::new("stream-move");
        let mut streamer = streamer(&dir);
        let (viewer, rx) = attach(&mut streamer, 1, (0, 0), 2);
        settle(&mut streamer);
        rx.try_iter().for_each(drop);

        let diff = streamer.request_move(viewer, ChunkPos::new(3, 0), 1).unwrap();
        assert_eq!(diff.added.len(), 6);
        assert_eq!(diff.removed.len(), 22);
        settle(&mut streamer);

        let received = frames(&rx);
        assert_eq!(received[0], (FrameKind::SetCenter, ChunkPos::new(3, 0)));
        assert_eq!(received.len(), 1 + 22 + 6);
        assert_eq!(streamer.tracker(viewer).unwrap().radius(), Some(1));
    }

    #[test]
    fn detach_unloads_everything() {
        let dir = TempDir::new("stream-detach");
        let mut streamer = streamer(&dir);
        let (viewer, rx) = attach(&mut streamer, 1, (2, 2), 1);
        settle(&mut streamer);
        rx.try_iter().for_each(drop);

        let diff = streamer.request_detach(viewer).unwrap();
        assert_eq!(diff.removed.len(), 9);
        let received = frames(&rx);
        assert_eq!(received.len(), 9);
        assert!(received.iter().all(|(kind, _)| *kind == FrameKind::UnloadChunk));
        assert_eq!(streamer.viewer_count(), 0);
        assert!(!streamer.is_watched(ChunkPos::new(2, 2)));

        assert!(matches!(
            streamer.request_recenter(viewer, ChunkPos::new(0, 0)),
            Err(StreamError::UnknownViewer(v)) if v == viewer
        ));
        assert!(matches!(
            streamer.request_detach(viewer),
            Err(StreamError::UnknownViewer(_))
        ));
    }

    #[test]
    fn duplicate_attach_is_rejected() {
        let dir = TempDir::new("stream-duplicate");
        let mut streamer = streamer(&dir);
        let (viewer, _rx) = attach(&mut streamer, 7, (0, 0), 0);
        let (tx, _rx2) = channel::unbounded::<Frame>();
        assert!(matches!(
            streamer.request_attach(viewer, ChunkPos::new(0, 0), None, Box::new(tx)),
            Err(StreamError::DuplicateViewer(_))
        ));
    }

    #[test]
    fn radius_is_clamped_and_defaulted() {
        let dir = TempDir::new("stream-clamp");
        let store = Arc::new(ChunkStore::new(StoreConfig::new(dir.join("region"))));
        let mut streamer = ChunkStreamer::new(
            StreamingConfig {
                default_view_radius: 1,
                max_view_radius: 2,
                ..StreamingConfig::default()
            },
            store,
        );
        let (tx, _rx) = channel::unbounded::<Frame>();
        streamer
            .request_attach(ViewerId(1), ChunkPos::new(0, 0), None, Box::new(tx))
            .unwrap();
        assert_eq!(streamer.tracker(ViewerId(1)).unwrap().radius(), Some(1));

        let diff = streamer.request_set_radius(ViewerId(1), 50).unwrap();
        assert_eq!(diff.added.len(), 16);
        assert_eq!(streamer.tracker(ViewerId(1)).unwrap().radius(), Some(2));
    }

    #[test]
    fn failed_load_reaches_viewer_as_unload() {
        let dir = TempDir::new("stream-corrupt");
        let region_dir = dir.join("region");
        std::fs::create_dir_all(&region_dir).unwrap();
        {
            let mut region =
                RegionFile::open(region_dir.join("r.0.0.mca"), RegionOptions::default()).unwrap();
            region.write(ChunkPos::new(0, 0), b"garbage").unwrap();
        }

        let mut streamer = streamer(&dir);
        let (_, rx) = attach(&mut streamer, 1, (0, 0), 0);
        settle(&mut streamer);

        assert_eq!(
            frames(&rx),
            vec![
                (FrameKind::SetCenter, ChunkPos::new(0, 0)),
                (FrameKind::UnloadChunk, ChunkPos::new(0, 0)),
            ]
        );
        let failures = streamer.drain_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ChunkPos::new(0, 0));
        assert!(failures[0].1.is_corrupt());
        assert!(streamer.drain_failures().is_empty());
    }

    #[test]
    fn persisted_chunk_streams_and_unwatched_chunks_release() {
        let dir = TempDir::new("stream-persist");
        let mut streamer = streamer_with(
            &dir,
            StreamingConfig {
                release_interval: 0,
                ..StreamingConfig::default()
            },
        );
        let watched = ChunkPos::new(0, 0);
        let unwatched = ChunkPos::new(30, 30);
        streamer
            .persist_chunk(watched, Chunk::new(watched, vec![1, 2, 3]))
            .wait()
            .unwrap();
        streamer
            .persist_chunk(unwatched, Chunk::new(unwatched, vec![9]))
            .wait()
            .unwrap();

        let (_, rx) = attach(&mut streamer, 1, (0, 0), 0);
        settle(&mut streamer);
        let data = rx.try_iter().last().unwrap().message().unwrap();
        assert_eq!(
            data,
            StreamMessage::ChunkData {
                x: 0,
                z: 0,
                data: vec![1, 2, 3]
            }
        );

        assert_eq!(streamer.release_unwatched(), 1);
        streamer.store().flush().unwrap();
        assert!(streamer.store().is_resident(watched));
        assert_eq!(streamer.read_chunk(unwatched).wait().unwrap().payload, vec![9]);
    }

    #[test]
    fn chunks_left_behind_are_released_by_update() {
        let dir = TempDir::new("stream-auto-release");
        let mut streamer = streamer_with(
            &dir,
            StreamingConfig {
                release_interval: 1,
                ..StreamingConfig::default()
            },
        );
        let (viewer, _rx) = attach(&mut streamer, 1, (0, 0), 1);
        settle(&mut streamer);
        assert!(streamer.store().is_resident(ChunkPos::new(0, 0)));

        streamer.request_recenter(viewer, ChunkPos::new(10, 10)).unwrap();
        settle(&mut streamer);
        streamer.update();
        assert!(!streamer.store().is_resident(ChunkPos::new(0, 0)));
        assert!(streamer.store().is_resident(ChunkPos::new(10, 10)));
        assert!(streamer
            .store()
            .resident_positions()
            .iter()
            .all(|pos| streamer.is_watched(*pos)));
    }

    #[test]
    fn update_leaves_region_files_to_the_workers() {
        let dir = TempDir::new("stream-evict");
        let store = ChunkStore::new(StoreConfig {
            worker_threads: 2,
            region_idle_timeout: Duration::ZERO,
            ..StoreConfig::new(dir.join("region"))
        });
        let mut streamer = ChunkStreamer::new(StreamingConfig::default(), Arc::new(store));
        let pos = ChunkPos::new(3, 3);
        streamer
            .persist_chunk(pos, Chunk::new(pos, vec![7; 64]))
            .wait()
            .unwrap();
        assert_eq!(streamer.store().regions().len(), 1);

        let events = RegionEvents::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());
        tracing::subscriber::with_default(subscriber, || {
            streamer.update();
        });

        for _ in 0..5000 {
            if streamer.store().regions().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(streamer.store().regions().is_empty());
        assert!(events.0.lock().is_empty(), "{:?}", events.0.lock());
    }
}
