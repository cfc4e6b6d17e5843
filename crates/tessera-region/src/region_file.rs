//! On-disk region file codec.
//!
//! Layout: an 8 KiB header (location table, then timestamp table) followed by
//! sector-aligned payload blocks. Each block starts with a big-endian `u32`
//! length, then the scheme byte, then `length - 1` bytes of compressed data.
//!
//! Writes put payload bytes on disk before the header entries that point at
//! them, so a crash mid-write leaves the previous entry intact.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tessera_core::constants::{DEFAULT_MAX_CHUNK_BYTES, HEADER_SECTORS, REGION_SLOTS, SECTOR_SIZE};
use tessera_core::ChunkPos;
use tracing::{debug, warn};

use crate::compression::{CompressionScheme, EXTERNAL_FLAG};
use crate::error::{PayloadError, RegionError, Result};
use crate::header::{RegionHeader, HEADER_BYTES};
use crate::sector::{sectors_for, SectorBitmap, SectorRange, MAX_SECTOR_COUNT, MAX_SECTOR_OFFSET};

/// Bytes before the compressed data in a payload block: length + scheme.
const BLOCK_PREFIX: usize = 5;

/// Per-file behavior shared by every region in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionOptions {
    /// Upper bound on a decompressed payload, enforced on read and write.
    pub max_chunk_bytes: usize,
    /// Scheme used for new writes. Reads honor whatever scheme a slot was written with.
    pub compression: CompressionScheme,
    /// Sync payload bytes to disk before updating the header entry.
    pub sync_writes: bool,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            compression: CompressionScheme::Zlib,
            sync_writes: false,
        }
    }
}

/// An open region file.
pub struct RegionFile {
    path: PathBuf,
    file: File,
    header: RegionHeader,
    sectors: SectorBitmap,
    options: RegionOptions,
    read_only: bool,
    closed: bool,
}

impl RegionFile {
    /// Open a region file, creating it if absent.
    ///
    /// A file too short for the header, or not a whole number of sectors long,
    /// is logged and reset to an empty header. Location entries that point into
    /// the header, past the end of the file, or at sectors claimed by an earlier
    /// slot are dropped.
    pub fn open(path: impl Into<PathBuf>, options: RegionOptions) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        let mut region = Self {
            path,
            file,
            header: RegionHeader::empty(),
            sectors: SectorBitmap::new(),
            options,
            read_only: false,
            closed: false,
        };

        match check_length(len) {
            Ok(()) => region.load_header(len)?,
            Err(reason) => {
                if len > 0 {
                    let error = RegionError::CorruptHeader {
                        path: region.path.clone(),
                        reason,
                    };
                    warn!(%error, "treating region file as empty");
                }
                region.reset(len)?;
            }
        }

        debug!(
            path = %region.path.display(),
            slots = region.header.occupied().count(),
            "opened region file"
        );
        Ok(region)
    }

    /// Open an existing region file without modifying it.
    ///
    /// Nothing is created, padded or repaired. A file too short for the header
    /// is an error, and invalid location entries are dropped in memory only.
    /// Writes fail with [`RegionError::ReadOnly`].
    pub fn open_read_only(path: impl Into<PathBuf>, options: RegionOptions) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if let Err(reason) = check_length(len) {
            if len < HEADER_BYTES as u64 {
                return Err(RegionError::CorruptHeader { path, reason });
            }
            warn!(path = %path.display(), reason, "region file is not sector aligned");
        }

        let mut region = Self {
            path,
            file,
            header: RegionHeader::empty(),
            sectors: SectorBitmap::new(),
            options,
            read_only: true,
            closed: false,
        };
        region.load_header(len)?;
        debug!(
            path = %region.path.display(),
            slots = region.header.occupied().count(),
            "opened region file read-only"
        );
        Ok(region)
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn load_header(&mut self, file_len: u64) -> Result<()> {
        let mut bytes = vec![0u8; HEADER_BYTES];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut bytes)?;
        self.header = RegionHeader::from_bytes(&bytes);
        self.validate_entries(file_len)
    }

    fn validate_entries(&mut self, file_len: u64) -> Result<()> {
        let file_sectors = file_len / SECTOR_SIZE as u64;
        self.sectors.grow_to(file_sectors as usize);
        let mut dropped = 0usize;

        for index in 0..REGION_SLOTS {
            let Some(range) = self.header.location(index) else {
                continue;
            };
            let problem = if (range.offset as usize) < HEADER_SECTORS {
                Some("sector range overlaps the header")
            } else if range.count == 0 {
                Some("sector count is zero")
            } else if u64::from(range.end()) > file_sectors {
                Some("sector range extends past the end of the file")
            } else if !self.sectors.is_free(range) {
                Some("sector range overlaps another slot")
            } else {
                None
            };

            match problem {
                Some(reason) => {
                    warn!(
                        path = %self.path.display(),
                        index,
                        offset = range.offset,
                        count = range.count,
                        reason,
                        "dropping region entry"
                    );
                    self.header.clear(index);
                    dropped += 1;
                }
                None => self.sectors.reserve(range),
            }
        }

        if dropped > 0 && !self.read_only {
            self.write_header()?;
        }
        Ok(())
    }

    fn reset(&mut self, file_len: u64) -> Result<()> {
        self.header = RegionHeader::empty();
        self.sectors = SectorBitmap::new();
        self.write_header()?;
        let padded = file_len.next_multiple_of(SECTOR_SIZE as u64).max(HEADER_BYTES as u64);
        if padded != file_len {
            self.file.set_len(padded)?;
        }
        self.sectors.grow_to((padded / SECTOR_SIZE as u64) as usize);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &RegionOptions {
        &self.options
    }

    /// Location entry for a slot index
    pub fn entry(&self, index: usize) -> Option<SectorRange> {
        self.header.location(index)
    }

    /// Last write time of a slot, in epoch seconds. Advisory only.
    pub fn timestamp(&self, index: usize) -> u32 {
        self.header.timestamp(index)
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.header.location(pos.local_index()).is_some()
    }

    pub fn occupied_slots(&self) -> impl Iterator<Item = (usize, SectorRange)> + '_ {
        self.header.occupied()
    }

    /// Sectors currently backing the file, header included.
    pub fn sector_count(&self) -> u64 {
        self.sectors.len() as u64
    }

    /// Sectors within the file that no slot uses.
    pub fn free_sector_count(&self) -> u64 {
        (self.sectors.len() - self.sectors.used_count()) as u64
    }

    /// Read and decompress the payload stored for `pos`.
    ///
    /// Returns `Ok(None)` for an absent slot.
    #[tracing::instrument(level = "trace", skip_all, fields(chunk = %pos))]
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Vec<u8>>> {
        let index = pos.local_index();
        let Some(range) = self.header.location(index) else {
            return Ok(None);
        };
        let corrupt = |reason: String| RegionError::CorruptEntry { index, reason };

        let mut block = vec![0u8; range.byte_len()];
        self.file.seek(SeekFrom::Start(range.byte_offset()))?;
        if let Err(e) = self.file.read_exact(&mut block) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                corrupt("sector data is truncated".into())
            } else {
                e.into()
            });
        }

        let length = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
        let tag = block[4];
        if length == 0 {
            return Err(corrupt("stored length is zero".into()));
        }
        let scheme = CompressionScheme::from_id(tag & !EXTERNAL_FLAG)
            .ok_or_else(|| corrupt(format!("unknown compression scheme {}", tag & !EXTERNAL_FLAG)))?;
        let limit = self.options.max_chunk_bytes;
        let data_len = length - 1;

        if tag & EXTERNAL_FLAG != 0 {
            let compressed = self.read_external(pos, index, limit)?;
            return decode(scheme, &compressed, index, limit).map(Some);
        }

        if scheme == CompressionScheme::None && data_len > limit {
            return Err(RegionError::CapacityExceeded { limit, size: data_len });
        }
        if data_len > block.len() - BLOCK_PREFIX {
            return Err(corrupt(format!(
                "stored length {data_len} exceeds the {} byte sector range",
                block.len() - BLOCK_PREFIX
            )));
        }
        decode(scheme, &block[BLOCK_PREFIX..BLOCK_PREFIX + data_len], index, limit).map(Some)
    }

    fn read_external(&self, pos: ChunkPos, index: usize, limit: usize) -> Result<Vec<u8>> {
        let path = self.external_path(pos);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegionError::CorruptEntry {
                    index,
                    reason: format!("external chunk file {} is missing", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        // Compressed data for a payload within the limit never needs twice the space.
        let bound = (limit as u64).saturating_mul(2).saturating_add(SECTOR_SIZE as u64);
        let mut compressed = Vec::new();
        file.take(bound + 1).read_to_end(&mut compressed)?;
        if compressed.len() as u64 > bound {
            return Err(RegionError::CapacityExceeded {
                limit,
                size: compressed.len(),
            });
        }
        Ok(compressed)
    }

    /// Compress and store a payload for `pos`.
    ///
    /// Payloads larger than the configured maximum are refused with
    /// [`RegionError::CapacityExceeded`] and nothing is written.
    #[tracing::instrument(level = "trace", skip_all, fields(chunk = %pos, len = data.len()))]
    pub fn write(&mut self, pos: ChunkPos, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(RegionError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let limit = self.options.max_chunk_bytes;
        if data.len() > limit {
            return Err(RegionError::CapacityExceeded {
                limit,
                size: data.len(),
            });
        }

        let scheme = self.options.compression;
        let compressed = scheme.compress(data)?;
        let index = pos.local_index();
        let previous = self.header.location(index);

        let required = sectors_for(compressed.len() + BLOCK_PREFIX);
        let external = required > MAX_SECTOR_COUNT;
        let block = if external {
            self.write_external(pos, &compressed)?;
            frame(&[], scheme.id() | EXTERNAL_FLAG)
        } else {
            frame(&compressed, scheme.id())
        };
        let count = sectors_for(block.len());

        let (range, in_place) = match previous {
            Some(old) if count <= old.count => (SectorRange::new(old.offset, count), true),
            _ => (self.sectors.allocate(count), false),
        };
        if range.offset > MAX_SECTOR_OFFSET {
            self.sectors.release(range);
            return Err(RegionError::Full {
                path: self.path.clone(),
            });
        }

        if let Err(e) = self.write_block(range, &block) {
            if !in_place {
                self.sectors.release(range);
            }
            return Err(e);
        }

        self.header.set_location(index, Some(range));
        self.header.set_timestamp(index, now_seconds());
        self.write_header_entry(index)?;

        match previous {
            Some(old) if in_place => {
                self.sectors
                    .release(SectorRange::new(old.offset + count, old.count - count));
            }
            Some(old) => self.sectors.release(old),
            None => {}
        }

        // A one-sector slot may have been an external stub.
        if !external && previous.is_some_and(|old| old.count == 1) {
            self.remove_external(pos);
        }
        Ok(())
    }

    fn write_block(&mut self, range: SectorRange, block: &[u8]) -> Result<()> {
        let mut padded = vec![0u8; range.byte_len()];
        padded[..block.len()].copy_from_slice(block);
        self.file.seek(SeekFrom::Start(range.byte_offset()))?;
        self.file.write_all(&padded)?;
        if self.options.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn write_external(&self, pos: ChunkPos, compressed: &[u8]) -> Result<()> {
        let path = self.external_path(pos);
        let staging = path.with_extension("mcc.tmp");
        {
            let mut file = File::create(&staging)?;
            file.write_all(compressed)?;
            if self.options.sync_writes {
                file.sync_data()?;
            }
        }
        fs::rename(&staging, &path)?;
        debug!(path = %path.display(), bytes = compressed.len(), "wrote external chunk");
        Ok(())
    }

    fn remove_external(&self, pos: ChunkPos) {
        let path = self.external_path(pos);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale external chunk"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove external chunk"),
        }
    }

    fn external_path(&self, pos: ChunkPos) -> PathBuf {
        let name = format!("c.{}.{}.mcc", pos.x, pos.z);
        self.path
            .parent()
            .map_or_else(|| PathBuf::from(&name), |dir| dir.join(&name))
    }

    fn write_header_entry(&mut self, index: usize) -> Result<()> {
        let location = self.header.location(index).map_or(0, SectorRange::to_entry);
        let timestamp = self.header.timestamp(index);
        self.file
            .seek(SeekFrom::Start(RegionHeader::location_offset(index)))?;
        self.file.write_all(&location.to_be_bytes())?;
        self.file
            .seek(SeekFrom::Start(RegionHeader::timestamp_offset(index)))?;
        self.file.write_all(&timestamp.to_be_bytes())?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }

    /// Sync the file to disk.
    ///
    /// Header entries are written as each slot changes, so this never rewrites
    /// the tables from memory. Another handle on the same file keeps its entries.
    pub fn flush(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Pad to a whole number of sectors, flush, and release the handle.
    /// A read-only handle is released untouched.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.read_only {
            return Ok(());
        }
        let len = self.file.metadata()?.len();
        let padded = len.next_multiple_of(SECTOR_SIZE as u64);
        if padded != len {
            self.file.set_len(padded)?;
        }
        self.flush()?;
        debug!(path = %self.path.display(), "closed region file");
        Ok(())
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if let Err(error) = self.close_inner() {
            warn!(path = %self.path.display(), %error, "failed to close region file");
        }
    }
}

impl std::fmt::Debug for RegionFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionFile")
            .field("path", &self.path)
            .field("sectors", &self.sectors.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn check_length(len: u64) -> std::result::Result<(), String> {
    if len < HEADER_BYTES as u64 {
        Err(format!("file is {len} bytes, shorter than the {HEADER_BYTES} byte header"))
    } else if len % SECTOR_SIZE as u64 != 0 {
        Err(format!("file length {len} is not a multiple of {SECTOR_SIZE}"))
    } else {
        Ok(())
    }
}

fn frame(data: &[u8], tag: u8) -> Vec<u8> {
    let mut block = Vec::with_capacity(data.len() + BLOCK_PREFIX);
    block.extend_from_slice(&(data.len() as u32 + 1).to_be_bytes());
    block.push(tag);
    block.extend_from_slice(data);
    block
}

fn decode(scheme: CompressionScheme, data: &[u8], index: usize, limit: usize) -> Result<Vec<u8>> {
    scheme.decompress(data, limit).map_err(|e| match e {
        PayloadError::TooLarge { limit } => RegionError::CapacityExceeded {
            limit,
            size: limit + 1,
        },
        malformed @ PayloadError::Malformed { .. } => RegionError::CorruptEntry {
            index,
            reason: malformed.to_string(),
        },
    })
}

fn now_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as u32)
}
