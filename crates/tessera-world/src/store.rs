//! Asynchronous chunk store over the region layer.
//!
//! Every operation returns a [`Ticket`] immediately; region I/O and
//! (de)compression run on a pool of worker threads. Three rules hold per chunk
//! position:
//!
//! - At most one disk read is in flight. Later loads join its waiter list.
//! - Writes are applied in the order they were issued. Each position has a
//!   queue drained by a single job at a time.
//! - The latest saved or loaded value is kept resident, so a load issued after
//!   a save observes the saved value without touching disk.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tessera_core::constants::DEFAULT_MAX_CHUNK_BYTES;
use tessera_core::ChunkPos;
use tessera_region::{CompressionScheme, RegionCache, RegionError, RegionOptions};
use tracing::{debug, error, warn};

use crate::chunk::Chunk;
use crate::error::StoreError;
use crate::ticket::{Completer, Ticket, WaiterId};

/// Result of a load: the chunk, shared between every waiter.
pub type LoadResult = Result<Arc<Chunk>, StoreError>;

/// Result of a save or unload.
pub type SaveResult = Result<(), StoreError>;

/// Configuration for the chunk store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the region files.
    pub region_dir: PathBuf,
    /// Region file extension.
    pub region_extension: String,
    /// Maximum number of region files open at once.
    pub max_open_regions: usize,
    /// Region files untouched for this long are closed by maintenance.
    pub region_idle_timeout: Duration,
    /// Number of I/O worker threads.
    pub worker_threads: usize,
    /// Attempts per operation when the filesystem fails, including the first.
    pub io_retry_attempts: u32,
    /// Delay before the first retry. Doubles after each failed retry.
    pub io_retry_backoff: Duration,
    /// Upper bound on a serialized chunk.
    pub max_chunk_bytes: usize,
    /// Compression used for new writes.
    pub compression: CompressionScheme,
    /// Sync chunk data to disk before updating region headers.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            region_dir: PathBuf::from("region"),
            region_extension: "mca".to_string(),
            max_open_regions: 256,
            region_idle_timeout: Duration::from_secs(60),
            worker_threads: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            io_retry_attempts: 3,
            io_retry_backoff: Duration::from_millis(25),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            compression: CompressionScheme::Zlib,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Default configuration storing regions in `region_dir`.
    pub fn new(region_dir: impl Into<PathBuf>) -> Self {
        Self {
            region_dir: region_dir.into(),
            ..Self::default()
        }
    }

    fn region_options(&self) -> RegionOptions {
        RegionOptions {
            max_chunk_bytes: self.max_chunk_bytes,
            compression: self.compression,
            sync_writes: self.sync_writes,
        }
    }
}

/// Work item for the I/O pool.
#[derive(Debug, Clone, Copy)]
enum Job {
    /// Read a chunk and resolve its pending load.
    Load(ChunkPos),
    /// Apply queued writes for a chunk until its queue is empty.
    Drain(ChunkPos),
    /// Close region files idle past the configured timeout.
    EvictIdle,
}

enum WriteOp {
    Save {
        chunk: Arc<Chunk>,
        completer: Completer<()>,
    },
    /// Drop the resident copy if it is still the one from `generation`.
    Unload {
        generation: u64,
        completer: Completer<()>,
    },
}

impl WriteOp {
    fn fail(self, error: StoreError) {
        match self {
            Self::Save { completer, .. } | Self::Unload { completer, .. } => {
                completer.complete(Err(error));
            }
        }
    }
}

struct Resident {
    chunk: Arc<Chunk>,
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    /// Waiters on the in-flight read for each position.
    pending_loads: HashMap<ChunkPos, Vec<(WaiterId, Completer<Arc<Chunk>>)>>,
    /// Queued writes. A key is present while a drain job owns the position.
    write_queues: HashMap<ChunkPos, VecDeque<WriteOp>>,
    resident: HashMap<ChunkPos, Resident>,
    next_generation: u64,
}

impl StoreState {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// State shared with the worker threads.
struct StoreShared {
    config: StoreConfig,
    regions: RegionCache,
    state: Mutex<StoreState>,
    /// Signalled when the last write queue empties.
    writes_idle: Condvar,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    /// An [`Job::EvictIdle`] is queued and not yet picked up.
    eviction_queued: AtomicBool,
}

/// Asynchronous load/save façade over a directory of region files.
pub struct ChunkStore {
    shared: Arc<StoreShared>,
    /// Job queue for the workers. `None` once shut down.
    job_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_waiter: AtomicU64,
    shut_down: AtomicBool,
}

impl ChunkStore {
    /// Create a store and start its worker threads.
    pub fn new(config: StoreConfig) -> Self {
        let regions = RegionCache::new(
            config.region_dir.clone(),
            config.region_extension.clone(),
            NonZeroUsize::new(config.max_open_regions).unwrap_or(NonZeroUsize::MIN),
            config.region_options(),
        );
        let worker_count = config.worker_threads.max(1);
        let shared = Arc::new(StoreShared {
            config,
            regions,
            state: Mutex::new(StoreState::default()),
            writes_idle: Condvar::new(),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
            eviction_queued: AtomicBool::new(false),
        });

        let (job_tx, job_rx) = channel::unbounded::<Job>();
        let workers = (0..worker_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let jobs = job_rx.clone();
                thread::Builder::new()
                    .name(format!("chunk-io-{i}"))
                    .spawn(move || worker_loop(&shared, &jobs))
                    .expect("Failed to spawn chunk I/O worker thread")
            })
            .collect();

        debug!(
            dir = %shared.config.region_dir.display(),
            workers = worker_count,
            "chunk store started"
        );

        Self {
            shared,
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
            next_waiter: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Get the region file cache.
    pub fn regions(&self) -> &RegionCache {
        &self.shared.regions
    }

    fn next_waiter(&self) -> WaiterId {
        WaiterId(self.next_waiter.fetch_add(1, Ordering::Relaxed))
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Queue a job for the workers. Returns `false` once shut down.
    fn dispatch(&self, job: Job) -> bool {
        self.job_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(job).is_ok())
    }

    /// Load the chunk at `pos`.
    ///
    /// Resident chunks resolve immediately. Otherwise the caller joins the
    /// in-flight read for `pos`, starting one if there is none. An absent slot
    /// resolves to [`Chunk::empty`]; corrupt data resolves to an error.
    pub fn load(&self, pos: ChunkPos) -> Ticket<Arc<Chunk>> {
        let waiter = self.next_waiter();
        if self.is_shut_down() {
            return Ticket::resolved(waiter, Err(StoreError::ShutDown));
        }

        let mut state = self.shared.state.lock();
        if let Some(resident) = state.resident.get(&pos) {
            return Ticket::resolved(waiter, Ok(Arc::clone(&resident.chunk)));
        }

        let (completer, ticket) = Ticket::pending(waiter);
        if let Some(waiters) = state.pending_loads.get_mut(&pos) {
            waiters.push((waiter, completer));
            return ticket;
        }

        state.pending_loads.insert(pos, vec![(waiter, completer)]);
        if !self.dispatch(Job::Load(pos)) {
            for (_, completer) in state.pending_loads.remove(&pos).unwrap_or_default() {
                completer.complete(Err(StoreError::ShutDown));
            }
        }
        ticket
    }

    /// Withdraw a waiter from the pending load for `pos`.
    ///
    /// The read itself keeps going; its result still becomes resident and
    /// reaches any other waiters. Returns whether the waiter was found.
    pub fn cancel(&self, pos: ChunkPos, waiter: WaiterId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(waiters) = state.pending_loads.get_mut(&pos) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|(id, _)| *id != waiter);
        waiters.len() != before
    }

    /// Save `chunk` at `pos`.
    ///
    /// The chunk becomes the resident value right away, then the write is
    /// queued behind any earlier writes for the same position.
    pub fn save(&self, pos: ChunkPos, chunk: Chunk) -> Ticket<()> {
        let waiter = self.next_waiter();
        if self.is_shut_down() {
            return Ticket::resolved(waiter, Err(StoreError::ShutDown));
        }

        let chunk = Arc::new(Chunk { pos, ..chunk });
        let (completer, ticket) = Ticket::pending(waiter);
        let mut state = self.shared.state.lock();
        let generation = state.bump_generation();
        state.resident.insert(
            pos,
            Resident {
                chunk: Arc::clone(&chunk),
                generation,
            },
        );
        self.enqueue(&mut state, pos, WriteOp::Save { chunk, completer });
        ticket
    }

    /// Drop the resident copy of `pos` once every write queued before this call has finished.
    ///
    /// A save issued after the unload keeps its value resident.
    pub fn unload(&self, pos: ChunkPos) -> Ticket<()> {
        let waiter = self.next_waiter();
        let mut state = self.shared.state.lock();
        let Some(generation) = state.resident.get(&pos).map(|r| r.generation) else {
            return Ticket::resolved(waiter, Ok(()));
        };
        if !state.write_queues.contains_key(&pos) {
            state.resident.remove(&pos);
            return Ticket::resolved(waiter, Ok(()));
        }

        let (completer, ticket) = Ticket::pending(waiter);
        self.enqueue(&mut state, pos, WriteOp::Unload { generation, completer });
        ticket
    }

    fn enqueue(&self, state: &mut StoreState, pos: ChunkPos, op: WriteOp) {
        let scheduled = state.write_queues.contains_key(&pos);
        state.write_queues.entry(pos).or_default().push_back(op);
        if scheduled || self.dispatch(Job::Drain(pos)) {
            return;
        }
        for op in state.write_queues.remove(&pos).unwrap_or_default() {
            op.fail(StoreError::ShutDown);
        }
        if state.write_queues.is_empty() {
            self.shared.writes_idle.notify_all();
        }
    }

    /// Wait for every queued write, then flush all region headers.
    pub fn flush(&self) -> Result<(), StoreError> {
        {
            let mut state = self.shared.state.lock();
            while !state.write_queues.is_empty() {
                self.shared.writes_idle.wait(&mut state);
            }
        }
        self.shared
            .regions
            .flush_all()
            .map_err(|e| StoreError::Flush(e.to_string()))
    }

    /// Queue closing of region files idle for longer than the configured timeout.
    ///
    /// The files are closed on an I/O worker. At most one such job is queued at
    /// a time; returns `false` when one already is or the store is shut down.
    pub fn evict_idle_regions(&self) -> bool {
        if self.shared.eviction_queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.dispatch(Job::EvictIdle) {
            return true;
        }
        self.shared.eviction_queued.store(false, Ordering::Release);
        false
    }

    /// Finish queued work, flush, stop the workers and close every region file.
    ///
    /// Later calls return immediately. Operations issued afterwards fail
    /// with [`StoreError::ShutDown`].
    pub fn shutdown(&self) -> Result<(), StoreError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = self.flush();
        drop(self.job_tx.lock().take());
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("chunk I/O worker panicked");
            }
        }
        let closed = self
            .shared
            .regions
            .close_all()
            .map_err(|e| StoreError::Flush(e.to_string()));

        debug!(
            reads = self.disk_reads(),
            writes = self.disk_writes(),
            "chunk store shut down"
        );
        flushed.and(closed)
    }

    /// Number of region reads performed, retries included.
    pub fn disk_reads(&self) -> u64 {
        self.shared.disk_reads.load(Ordering::Relaxed)
    }

    /// Number of region writes that completed.
    pub fn disk_writes(&self) -> u64 {
        self.shared.disk_writes.load(Ordering::Relaxed)
    }

    /// Number of positions with a read in flight.
    pub fn pending_loads(&self) -> usize {
        self.shared.state.lock().pending_loads.len()
    }

    /// Number of resident chunks.
    pub fn resident_len(&self) -> usize {
        self.shared.state.lock().resident.len()
    }

    /// Check if a chunk is resident.
    pub fn is_resident(&self, pos: ChunkPos) -> bool {
        self.shared.state.lock().resident.contains_key(&pos)
    }

    /// Get the resident copy of a chunk.
    pub fn resident(&self, pos: ChunkPos) -> Option<Arc<Chunk>> {
        self.shared
            .state
            .lock()
            .resident
            .get(&pos)
            .map(|r| Arc::clone(&r.chunk))
    }

    /// Get all resident chunk positions.
    pub fn resident_positions(&self) -> Vec<ChunkPos> {
        self.shared.state.lock().resident.keys().copied().collect()
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(%error, "chunk store did not shut down cleanly");
        }
    }
}

/// Main worker loop - blocks waiting for jobs until the store shuts down.
fn worker_loop(shared: &StoreShared, jobs: &Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Load(pos) => shared.run_load(pos),
            Job::Drain(pos) => shared.run_drain(pos),
            Job::EvictIdle => shared.run_evict_idle(),
        }
    }
}

impl StoreShared {
    fn run_evict_idle(&self) {
        self.eviction_queued.store(false, Ordering::Release);
        let evicted = self.regions.evict_idle(self.config.region_idle_timeout);
        if evicted > 0 {
            debug!(evicted, "closed idle region files");
        }
    }

    fn run_load(&self, pos: ChunkPos) {
        let loaded = self.read_chunk(pos);

        let mut state = self.state.lock();
        let waiters = state.pending_loads.remove(&pos).unwrap_or_default();
        // A save that landed during the read is newer than what was on disk.
        let newer = state.resident.get(&pos).map(|r| Arc::clone(&r.chunk));
        let result = match (newer, loaded) {
            (Some(chunk), _) => Ok(chunk),
            (None, Ok(chunk)) => {
                let generation = state.bump_generation();
                state.resident.insert(
                    pos,
                    Resident {
                        chunk: Arc::clone(&chunk),
                        generation,
                    },
                );
                Ok(chunk)
            }
            (None, Err(error)) => {
                error!(%pos, %error, "chunk load failed");
                Err(error)
            }
        };
        drop(state);

        for (_, completer) in waiters {
            completer.complete(result.clone());
        }
    }

    fn run_drain(&self, pos: ChunkPos) {
        loop {
            let op = {
                let mut state = self.state.lock();
                let Some(queue) = state.write_queues.get_mut(&pos) else {
                    return;
                };
                match queue.pop_front() {
                    Some(op) => op,
                    None => {
                        state.write_queues.remove(&pos);
                        if state.write_queues.is_empty() {
                            self.writes_idle.notify_all();
                        }
                        return;
                    }
                }
            };

            match op {
                WriteOp::Save { chunk, completer } => completer.complete(self.write_chunk(&chunk)),
                WriteOp::Unload {
                    generation,
                    completer,
                } => {
                    let mut state = self.state.lock();
                    if state
                        .resident
                        .get(&pos)
                        .is_some_and(|r| r.generation == generation)
                    {
                        state.resident.remove(&pos);
                    }
                    drop(state);
                    completer.complete(Ok(()));
                }
            }
        }
    }

    fn read_chunk(&self, pos: ChunkPos) -> LoadResult {
        let bytes = self.with_retry(pos, || {
            let handle = self.regions.get(pos.region())?;
            self.disk_reads.fetch_add(1, Ordering::Relaxed);
            let mut region = handle.lock();
            region.read(pos)
        })?;

        let Some(bytes) = bytes else {
            return Ok(Arc::new(Chunk::empty(pos)));
        };
        let chunk = Chunk::from_bytes(&bytes).map_err(|e| StoreError::Corrupt {
            pos,
            reason: e.to_string(),
        })?;
        if chunk.pos != pos {
            return Err(StoreError::Corrupt {
                pos,
                reason: format!("slot holds the record for chunk {}", chunk.pos),
            });
        }
        Ok(Arc::new(chunk))
    }

    fn write_chunk(&self, chunk: &Chunk) -> SaveResult {
        let pos = chunk.pos;
        let bytes = chunk.to_bytes().map_err(|e| StoreError::Corrupt {
            pos,
            reason: e.to_string(),
        })?;

        let result = self.with_retry(pos, || {
            let handle = self.regions.get(pos.region())?;
            let mut region = handle.lock();
            region.write(pos, &bytes)
        });
        match &result {
            Ok(()) => {
                self.disk_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => error!(%pos, %error, "chunk save failed"),
        }
        result
    }

    /// Run a region operation, retrying filesystem failures with doubling backoff.
    fn with_retry<T>(
        &self,
        pos: ChunkPos,
        mut op: impl FnMut() -> Result<T, RegionError>,
    ) -> Result<T, StoreError> {
        let attempts = self.config.io_retry_attempts.max(1);
        let mut backoff = self.config.io_retry_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(RegionError::Io(e)) if attempt < attempts => {
                    warn!(%pos, attempt, error = %e, ?backoff, "chunk I/O failed, retrying");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::from_region(pos, e, attempt)),
            }
        }
    }
}
