//! Bounded cache of open region files.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tessera_core::RegionPos;
use tracing::{debug, warn};

use crate::error::{RegionError, Result};
use crate::region_file::{RegionFile, RegionOptions};

/// Shared handle to an open region file. All access goes through its lock.
pub type RegionHandle = Arc<Mutex<RegionFile>>;

struct CachedRegion {
    handle: RegionHandle,
    last_access: Instant,
}

struct CacheInner {
    open: LruCache<RegionPos, CachedRegion>,
    /// Evicted handles still held by in-flight operations.
    retired: HashMap<RegionPos, Weak<Mutex<RegionFile>>>,
    /// Regions whose file is being opened or closed outside the lock.
    busy: HashSet<RegionPos>,
}

/// LRU cache of region file handles for one directory.
///
/// A handle evicted while another thread still holds it is parked as a weak
/// reference and handed out again if its region is requested before the last
/// holder drops it, so a region never has two open handles at once. The file
/// is closed when the last reference goes away.
///
/// Files are opened and closed without holding the cache lock. A region in
/// the middle of either is marked busy and requests for it wait; requests for
/// other regions go ahead.
pub struct RegionCache {
    dir: PathBuf,
    extension: String,
    options: RegionOptions,
    inner: Mutex<CacheInner>,
    settled: Condvar,
}

impl RegionCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        capacity: NonZeroUsize,
        options: RegionOptions,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            options,
            inner: Mutex::new(CacheInner {
                open: LruCache::new(capacity),
                retired: HashMap::new(),
                busy: HashSet::new(),
            }),
            settled: Condvar::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `region`
    pub fn region_path(&self, region: RegionPos) -> PathBuf {
        self.dir.join(region.file_name(&self.extension))
    }

    /// Get the handle for `region`, opening (and creating) the file on a miss.
    pub fn get(&self, region: RegionPos) -> Result<RegionHandle> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(cached) = inner.open.get_mut(&region) {
                cached.last_access = Instant::now();
                return Ok(Arc::clone(&cached.handle));
            }
            if let Some(handle) = inner.retired.remove(&region).and_then(|weak| weak.upgrade()) {
                debug!(%region, "reusing retired region handle");
                let evicted = insert(&mut inner, region, &handle);
                drop(inner);
                self.close_evicted(evicted);
                return Ok(handle);
            }
            if !inner.busy.contains(&region) {
                break;
            }
            self.settled.wait(&mut inner);
        }
        inner.busy.insert(region);
        drop(inner);

        let opened = fs::create_dir_all(&self.dir)
            .map_err(RegionError::from)
            .and_then(|()| RegionFile::open(self.region_path(region), self.options.clone()));

        let mut inner = self.inner.lock();
        inner.busy.remove(&region);
        self.settled.notify_all();
        let handle = Arc::new(Mutex::new(opened?));
        let evicted = insert(&mut inner, region, &handle);
        drop(inner);
        self.close_evicted(evicted);
        Ok(handle)
    }

    /// Whether a handle for `region` is currently cached.
    pub fn contains(&self, region: RegionPos) -> bool {
        self.inner.lock().open.contains(&region)
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().open.cap().get()
    }

    /// Evict handles not accessed within `max_idle`. Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let idle: Vec<RegionPos> = inner
            .open
            .iter()
            .filter(|(_, cached)| now.duration_since(cached.last_access) >= max_idle)
            .map(|(region, _)| *region)
            .collect();

        let mut closing = Vec::new();
        for region in &idle {
            if let Some(cached) = inner.open.pop(region) {
                closing.extend(retire(&mut inner, *region, cached.handle));
            }
        }
        drop(inner);

        self.close_evicted(closing);
        if !idle.is_empty() {
            debug!(count = idle.len(), "evicted idle region handles");
        }
        idle.len()
    }

    /// Sync every live handle to disk in parallel.
    ///
    /// Every handle is attempted; the first error is returned.
    pub fn flush_all(&self) -> Result<()> {
        let handles = self.live_handles();
        let results: Vec<Result<()>> = handles
            .par_iter()
            .map(|handle| handle.lock().flush())
            .collect();
        results.into_iter().collect()
    }

    /// Drop every cached handle, closing those no one else holds.
    pub fn close_all(&self) -> Result<()> {
        let handles = {
            let mut inner = self.inner.lock();
            let mut handles = Vec::new();
            while let Some((region, cached)) = inner.open.pop_lru() {
                handles.push((region, cached.handle));
            }
            let retired: Vec<_> = inner
                .retired
                .drain()
                .filter_map(|(region, weak)| weak.upgrade().map(|handle| (region, handle)))
                .collect();
            handles.extend(retired);
            inner.busy.extend(handles.iter().map(|(region, _)| *region));
            handles
        };

        let mut first_error = None;
        for (region, handle) in handles {
            if let Err(error) = close_or_flush(region, handle) {
                first_error.get_or_insert(error);
            }
            self.settle(region);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn live_handles(&self) -> Vec<RegionHandle> {
        let inner = self.inner.lock();
        inner
            .open
            .iter()
            .map(|(_, cached)| Arc::clone(&cached.handle))
            .chain(inner.retired.values().filter_map(Weak::upgrade))
            .collect()
    }

    /// Close files taken out of the cache. Their regions were marked busy by [`retire`].
    fn close_evicted(&self, evicted: impl IntoIterator<Item = (RegionPos, RegionFile)>) {
        for (region, file) in evicted {
            if let Err(error) = file.close() {
                warn!(%region, %error, "failed to close evicted region file");
            }
            self.settle(region);
        }
    }

    fn settle(&self, region: RegionPos) {
        self.inner.lock().busy.remove(&region);
        self.settled.notify_all();
    }
}

impl Drop for RegionCache {
    fn drop(&mut self) {
        if let Err(error) = self.close_all() {
            warn!(dir = %self.dir.display(), %error, "failed to close region cache");
        }
    }
}

fn insert(
    inner: &mut CacheInner,
    region: RegionPos,
    handle: &RegionHandle,
) -> Option<(RegionPos, RegionFile)> {
    let cached = CachedRegion {
        handle: Arc::clone(handle),
        last_access: Instant::now(),
    };
    let (evicted, old) = inner.open.push(region, cached)?;
    debug!(region = %evicted, "evicting region handle");
    retire(inner, evicted, old.handle)
}

/// Take a handle out of service. Returns the file when no one else holds it,
/// with its region marked busy until the caller has closed it.
fn retire(
    inner: &mut CacheInner,
    region: RegionPos,
    handle: RegionHandle,
) -> Option<(RegionPos, RegionFile)> {
    inner.retired.retain(|_, weak| weak.strong_count() > 0);
    match Arc::try_unwrap(handle) {
        Ok(file) => {
            inner.busy.insert(region);
            Some((region, file.into_inner()))
        }
        Err(shared) => {
            inner.retired.insert(region, Arc::downgrade(&shared));
            None
        }
    }
}

fn close_or_flush(region: RegionPos, handle: RegionHandle) -> Result<()> {
    let result = match Arc::try_unwrap(handle) {
        Ok(file) => file.into_inner().close(),
        Err(shared) => {
            debug!(%region, "region still in use, syncing instead of closing");
            let mut file = shared.lock();
            file.flush()
        }
    };
    if let Err(error) = &result {
        warn!(%region, %error, "failed to close region file");
    }
    result
}
