//! Fan-out of loaded chunks to viewers.
//!
//! Visibility diffs arrive as per-viewer add/remove events. Adds register the
//! viewer on a single in-flight load per chunk; [`StreamingBroadcaster::pump`]
//! collects finished loads, encodes each chunk once, and sends the same frame
//! to every viewer still waiting on it. Removes withdraw the viewer first and
//! then send the unload, so a chunk's data never follows its unload.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use tessera_core::ChunkPos;
use tracing::{debug, error, warn};

use crate::chunk::Chunk;
use crate::error::StoreError;
use crate::protocol::{Frame, StreamMessage, ViewerConnection};
use crate::store::ChunkStore;
use crate::ticket::Ticket;
use crate::ViewerId;

/// A viewer's outgoing connection.
struct ViewerSink {
    connection: Box<dyn ViewerConnection>,
    connected: bool,
}

impl ViewerSink {
    /// Send a frame, marking the viewer disconnected on failure.
    fn deliver(&mut self, viewer: ViewerId, frame: &Frame) -> bool {
        if !self.connected {
            return false;
        }
        match self.connection.send_frame(frame) {
            Ok(()) => true,
            Err(error) => {
                warn!(%viewer, %error, "viewer connection failed");
                self.connected = false;
                false
            }
        }
    }
}

/// One chunk load shared by every viewer waiting on it.
struct InFlight {
    ticket: Ticket<Arc<Chunk>>,
    /// Viewers that will receive the chunk, in the order they asked.
    waiting: Vec<ViewerId>,
    /// Matches the request queue entry for this load.
    seq: u64,
}

/// Sends chunk data and unload messages to viewers.
pub struct StreamingBroadcaster {
    store: Arc<ChunkStore>,
    viewers: HashMap<ViewerId, ViewerSink>,
    in_flight: HashMap<ChunkPos, InFlight>,
    /// Loads in request order. Entries whose sequence no longer matches are stale.
    requests: VecDeque<(ChunkPos, u64)>,
    next_seq: u64,
    failures: Vec<(ChunkPos, StoreError)>,
    max_sends_per_update: usize,
    chunks_encoded: u64,
    frames_sent: u64,
}

impl StreamingBroadcaster {
    /// Create a broadcaster loading chunks from `store`.
    ///
    /// Each [`pump`](Self::pump) stops starting new chunks once
    /// `max_sends_per_update` frames have gone out.
    pub fn new(store: Arc<ChunkStore>, max_sends_per_update: usize) -> Self {
        Self {
            store,
            viewers: HashMap::new(),
            in_flight: HashMap::new(),
            requests: VecDeque::new(),
            next_seq: 0,
            failures: Vec::new(),
            max_sends_per_update: max_sends_per_update.max(1),
            chunks_encoded: 0,
            frames_sent: 0,
        }
    }

    /// Register a viewer's connection.
    pub fn add_viewer(&mut self, viewer: ViewerId, connection: Box<dyn ViewerConnection>) {
        self.viewers.insert(
            viewer,
            ViewerSink {
                connection,
                connected: true,
            },
        );
    }

    /// Drop a viewer's connection and withdraw it from every pending load.
    pub fn remove_viewer(&mut self, viewer: ViewerId) -> bool {
        let waiting_on: Vec<ChunkPos> = self
            .in_flight
            .iter()
            .filter(|(_, load)| load.waiting.contains(&viewer))
            .map(|(pos, _)| *pos)
            .collect();
        for pos in waiting_on {
            self.withdraw(pos, viewer);
        }
        self.viewers.remove(&viewer).is_some()
    }

    /// Check if a viewer is registered and its connection has not failed.
    pub fn is_connected(&self, viewer: ViewerId) -> bool {
        self.viewers.get(&viewer).is_some_and(|sink| sink.connected)
    }

    /// Send a viewer its new center. Goes out immediately.
    pub fn send_center(&mut self, viewer: ViewerId, center: ChunkPos) {
        match Frame::set_center(center) {
            Ok(frame) => self.deliver(viewer, &frame),
            Err(error) => error!(%viewer, %center, %error, "failed to encode center"),
        }
    }

    /// A chunk entered `viewer`'s view: start (or join) its load.
    pub fn on_chunk_added(&mut self, pos: ChunkPos, viewer: ViewerId) {
        if let Some(load) = self.in_flight.get_mut(&pos) {
            if !load.waiting.contains(&viewer) {
                load.waiting.push(viewer);
            }
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(
            pos,
            InFlight {
                ticket: self.store.load(pos),
                waiting: vec![viewer],
                seq,
            },
        );
        self.requests.push_back((pos, seq));
    }

    /// A chunk left `viewer`'s view: send the unload to that viewer only.
    ///
    /// Storage is not touched. If the chunk was still loading, the viewer
    /// will not receive it.
    pub fn on_chunk_removed(&mut self, pos: ChunkPos, viewer: ViewerId) {
        self.withdraw(pos, viewer);
        match Frame::unload(pos) {
            Ok(frame) => self.deliver(viewer, &frame),
            Err(error) => error!(%viewer, %pos, %error, "failed to encode unload"),
        }
    }

    fn withdraw(&mut self, pos: ChunkPos, viewer: ViewerId) {
        let Some(load) = self.in_flight.get_mut(&pos) else {
            return;
        };
        load.waiting.retain(|v| *v != viewer);
        if load.waiting.is_empty() {
            if let Some(load) = self.in_flight.remove(&pos) {
                self.store.cancel(pos, load.ticket.waiter());
            }
        }
    }

    fn deliver(&mut self, viewer: ViewerId, frame: &Frame) {
        if let Some(sink) = self.viewers.get_mut(&viewer) {
            if sink.deliver(viewer, frame) {
                self.frames_sent += 1;
            }
        }
    }

    /// Deliver every finished load. Returns the number of frames sent.
    ///
    /// Loads that failed are reported to their viewers as unloads and kept
    /// for [`drain_failures`](Self::drain_failures).
    pub fn pump(&mut self) -> usize {
        let mut sent = 0;
        let mut remaining = self.requests.len();

        while remaining > 0 && sent < self.max_sends_per_update {
            remaining -= 1;
            let Some((pos, seq)) = self.requests.pop_front() else {
                break;
            };
            let Some(load) = self.in_flight.get_mut(&pos) else {
                continue;
            };
            if load.seq != seq {
                continue;
            }
            let Some(result) = load.ticket.take() else {
                self.requests.push_back((pos, seq));
                continue;
            };
            let Some(load) = self.in_flight.remove(&pos) else {
                continue;
            };

            let frame = result.and_then(|chunk| self.encode_chunk(&chunk));
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    error!(%pos, %error, "chunk unavailable to viewers");
                    self.failures.push((pos, error));
                    match Frame::unload(pos) {
                        Ok(frame) => frame,
                        Err(error) => {
                            error!(%pos, %error, "failed to encode unload");
                            continue;
                        }
                    }
                }
            };

            for viewer in load.waiting {
                if let Some(sink) = self.viewers.get_mut(&viewer) {
                    if sink.deliver(viewer, &frame) {
                        sent += 1;
                    }
                }
            }
        }

        if sent > 0 {
            debug!(sent, pending = self.in_flight.len(), "streamed chunks");
        }
        self.frames_sent += sent as u64;
        sent
    }

    fn encode_chunk(&mut self, chunk: &Chunk) -> Result<Frame, StoreError> {
        let message = StreamMessage::ChunkData {
            x: chunk.pos.x,
            z: chunk.pos.z,
            data: chunk.payload.clone(),
        };
        let frame = Frame::encode(&message).map_err(|e| StoreError::Corrupt {
            pos: chunk.pos,
            reason: e.to_string(),
        })?;
        self.chunks_encoded += 1;
        Ok(frame)
    }

    /// Take the load failures recorded since the last call.
    pub fn drain_failures(&mut self) -> Vec<(ChunkPos, StoreError)> {
        std::mem::take(&mut self.failures)
    }

    /// Number of chunk loads not yet delivered.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of chunks serialized into frames so far.
    pub fn chunks_encoded(&self) -> u64 {
        self.chunks_encoded
    }

    /// Number of frames delivered so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}
