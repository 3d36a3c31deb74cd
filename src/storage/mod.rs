//! The segmented storage engine.
//!
//! [`StorageEngine`] owns a circular bank of fixed-size append-only
//! segments (RAM or file backed), the main-queue [`MemoryIndex`] over
//! them, and the reader/writer plumbing between the two. Payload bytes
//! live in segments; the index is the only authoritative pointer to them.
//!
//! Writes append to the active segment of the item's popularity rank,
//! sealing and replacing it when full. Sealed file segments move to one
//! data file each. Reads are positioned: the index entry supplies
//! `(segment id, offset, size)` and the engine issues a single read.
//! Reclamation happens wholesale through [`StorageEngine::release_segment`]
//! driven by the scavenger.

pub mod file;
pub mod prefetch;
pub mod reader;
pub mod segment;
pub mod writer;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::config::{CacheConfig, CacheKind};
use crate::error::{CacheError, CacheResult};
use crate::eviction::SlruPolicy;
use crate::index::format::EMBEDDED_SID;
use crate::index::{EntryRemovalListener, MemoryIndex, MutationResult};
use crate::util::{
    get_u16, get_u32, get_u64, get_u8, put_u16, put_u32, put_u64, put_u8, read_uvarint,
    write_uvarint,
};
use file::FileBackend;
use prefetch::PrefetchBuffer;
use reader::{BaseFileDataReader, BaseMemoryDataReader, DataReader};
use segment::{
    encode_item, encoded_item_size, item_kv_size, RamSegmentScanner, ScanItem, Segment,
    SegmentInfo, SegmentState,
};
use writer::{BaseDataWriter, BlockDataWriter, DataWriter};

const ENGINE_SNAPSHOT_MAGIC: u32 = 0x5443_454E; // "TCEN"

/// Highest usable segment id; `EMBEDDED_SID` is reserved by the index
/// format.
const MAX_SEGMENT_ID: usize = EMBEDDED_SID as usize - 1;

/// Shared segment bank: id allocation, per-rank active segments, byte
/// accounting.
pub struct SegmentPool {
    segment_size: usize,
    max_segments: usize,
    slots: RwLock<Vec<Option<Arc<Segment>>>>,
    free_ids: Mutex<Vec<u16>>,
    active: Vec<Mutex<Option<Arc<Segment>>>>,
    used_bytes: AtomicU64,
    allocated_bytes: AtomicU64,
    items_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl SegmentPool {
    fn new(segment_size: usize, max_size: u64, num_ranks: usize) -> Self {
        let max_segments = if max_size == 0 {
            MAX_SEGMENT_ID + 1
        } else {
            ((max_size / segment_size as u64) as usize).clamp(1, MAX_SEGMENT_ID + 1)
        };
        Self {
            segment_size,
            max_segments,
            slots: RwLock::new(Vec::new()),
            free_ids: Mutex::new(Vec::new()),
            active: (0..num_ranks).map(|_| Mutex::new(None)).collect(),
            used_bytes: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
            items_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Segment by id, if currently allocated.
    pub fn get(&self, sid: u16) -> Option<Arc<Segment>> {
        self.slots.read().get(sid as usize).cloned().flatten()
    }

    fn allocate(&self, now: u64) -> CacheResult<Arc<Segment>> {
        let id = {
            let reused = self.free_ids.lock().pop();
            match reused {
                Some(id) => id,
                None => {
                    let mut slots = self.slots.write();
                    if slots.len() >= self.max_segments {
                        return Err(CacheError::OutOfMemory);
                    }
                    slots.push(None);
                    (slots.len() - 1) as u16
                }
            }
        };
        let seg = Arc::new(Segment::new(id, self.segment_size, now));
        self.slots.write()[id as usize] = Some(seg.clone());
        self.allocated_bytes
            .fetch_add(self.segment_size as u64, Ordering::Relaxed);
        Ok(seg)
    }

    /// Statistics snapshots of all sealed segments.
    pub fn sealed_infos(&self) -> Vec<SegmentInfo> {
        self.slots
            .read()
            .iter()
            .flatten()
            .filter(|seg| seg.is_sealed())
            .map(|seg| seg.info())
            .collect()
    }

    /// Sum of active items across allocated segments.
    pub fn total_active_items(&self) -> u64 {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|seg| u64::from(seg.info().total_active_items))
            .sum()
    }

    /// Sum of total (alive or dead) items across allocated segments.
    pub fn total_items(&self) -> u64 {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|seg| u64::from(seg.info().total_items))
            .sum()
    }

    /// Number of currently allocated segments.
    pub fn segment_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    /// Bytes of appended item data currently held.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Bytes reserved by allocated segments.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Mean encoded item size observed so far; 1 KiB before any writes.
    pub fn mean_item_size(&self) -> u64 {
        let items = self.items_written.load(Ordering::Relaxed);
        if items == 0 {
            1024
        } else {
            (self.bytes_written.load(Ordering::Relaxed) / items).max(1)
        }
    }
}

impl EntryRemovalListener for SegmentPool {
    fn entry_removed(&self, sid: u16, _expired: bool) {
        if let Some(seg) = self.get(sid) {
            seg.item_removed();
        }
    }
}

/// Reusable scratch buffers for point reads.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max: usize,
}

impl BufferPool {
    fn new(max: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max,
        }
    }

    fn take(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max {
            buffers.push(buf);
        }
    }
}

/// Sequential scanner over one segment, RAM or file resident.
pub enum SegmentScanner {
    Ram(RamSegmentScanner),
    File { buffer: PrefetchBuffer, block_size: Option<usize> },
}

impl SegmentScanner {
    /// Next item in the segment, or `None` at the end.
    pub fn next_item(&mut self) -> CacheResult<Option<ScanItem>> {
        match self {
            SegmentScanner::Ram(scanner) => Ok(scanner.next_item()),
            SegmentScanner::File { buffer, block_size } => {
                buffer.next_item(*block_size).map_err(CacheError::Io)
            }
        }
    }
}

/// Segmented storage engine over RAM or file segments.
pub struct StorageEngine {
    kind: CacheKind,
    segment_size: usize,
    embedded: bool,
    embedded_max: usize,
    prefetch_size: usize,
    pool: Arc<SegmentPool>,
    index: MemoryIndex,
    backend: Option<FileBackend>,
    data_reader: Box<dyn DataReader>,
    data_writer: Box<dyn DataWriter>,
    scratch: BufferPool,
    clock: Arc<dyn Clock>,
}

impl StorageEngine {
    /// Build an engine from a validated configuration.
    pub fn new(cfg: &CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let pool = Arc::new(SegmentPool::new(
            cfg.segment_size,
            cfg.max_size,
            cfg.num_popularity_ranks,
        ));
        let policy = Box::new(SlruPolicy::new(
            cfg.slru_num_segments,
            cfg.slru_insert_point,
            cfg.num_popularity_ranks,
        ));
        let index = MemoryIndex::main(
            policy,
            cfg.index_slots_power,
            cfg.num_popularity_ranks,
            cfg.eviction_disabled_mode,
            Some(pool.clone() as Arc<dyn EntryRemovalListener>),
            clock.clone(),
        );
        let backend = match cfg.kind {
            CacheKind::File => Some(FileBackend::new(
                cfg.data_dir.join(&cfg.cache_name),
                cfg.sparse_files_support,
            )?),
            CacheKind::Offheap => None,
        };
        let data_reader: Box<dyn DataReader> = match cfg.kind {
            CacheKind::Offheap => Box::new(BaseMemoryDataReader),
            CacheKind::File => Box::new(BaseFileDataReader),
        };
        let data_writer: Box<dyn DataWriter> = if cfg.block_writer_block_size > 0 {
            Box::new(BlockDataWriter::new(cfg.block_writer_block_size))
        } else {
            Box::new(BaseDataWriter)
        };
        Ok(Self {
            kind: cfg.kind,
            segment_size: cfg.segment_size,
            embedded: cfg.index_data_embedded,
            embedded_max: cfg.index_data_embedded_size,
            prefetch_size: cfg.file_prefetch_buffer_size,
            pool,
            index,
            backend,
            data_reader,
            data_writer,
            scratch: BufferPool::new(cfg.storage_pool_size),
            clock,
        })
    }

    /// The engine's main-queue index.
    pub fn index(&self) -> &MemoryIndex {
        &self.index
    }

    /// The engine's segment pool.
    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    /// Storage backend kind.
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Store an item and index it. On success the item is immediately
    /// findable.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        expire: u64,
        rank: usize,
    ) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        let kv = item_kv_size(key.len(), value.len());
        if self.embedded && (kv as usize) <= self.embedded_max {
            let mut payload = Vec::with_capacity(kv as usize);
            write_uvarint(&mut payload, key.len() as u64);
            write_uvarint(&mut payload, value.len() as u64);
            payload.extend_from_slice(key);
            payload.extend_from_slice(value);
            return match self.index.insert_embedded(key, &payload, expire, Some(rank)) {
                MutationResult::Failed => Err(CacheError::InsertFailed),
                _ => Ok(()),
            };
        }

        let item_size = encoded_item_size(key.len(), value.len());
        if item_size > self.segment_size {
            return Err(CacheError::ItemTooLarge);
        }
        let mut item = Vec::with_capacity(item_size);
        encode_item(&mut item, key, value, expire);
        let (sid, offset) = self.append_to_rank(rank, &item)?;
        match self.index.insert(key, sid, offset, kv, expire, Some(rank)) {
            MutationResult::Failed => {
                // The appended bytes are now dead; keep segment stats honest.
                if let Some(seg) = self.pool.get(sid) {
                    seg.item_removed();
                }
                Err(CacheError::InsertFailed)
            }
            _ => Ok(()),
        }
    }

    /// Append an already-validated item for the scavenger's rewrite path.
    /// Returns the new location; the caller updates the index.
    pub fn rewrite(
        &self,
        key: &[u8],
        value: &[u8],
        expire: u64,
        rank: usize,
    ) -> CacheResult<(u16, u32)> {
        let item_size = encoded_item_size(key.len(), value.len());
        if item_size > self.segment_size {
            return Err(CacheError::ItemTooLarge);
        }
        let mut item = Vec::with_capacity(item_size);
        encode_item(&mut item, key, value, expire);
        self.append_to_rank(rank, &item)
    }

    fn append_to_rank(&self, rank: usize, item: &[u8]) -> CacheResult<(u16, u32)> {
        let rank = rank.min(self.pool.active.len() - 1);
        let mut active = self.pool.active[rank].lock();
        loop {
            if active.is_none() {
                *active = Some(self.pool.allocate(self.clock.now_millis())?);
            }
            let seg = active.as_ref().unwrap().clone();
            let before = seg.write_offset();
            if let Some(offset) = self.data_writer.write(&seg, item) {
                let grown = seg.write_offset() - before;
                self.pool
                    .used_bytes
                    .fetch_add(u64::from(grown), Ordering::Relaxed);
                self.pool.items_written.fetch_add(1, Ordering::Relaxed);
                self.pool
                    .bytes_written
                    .fetch_add(item.len() as u64, Ordering::Relaxed);
                return Ok((seg.id(), offset));
            }
            // Padding appended by a failed aligned write still occupies space.
            let grown = seg.write_offset() - before;
            if grown > 0 {
                self.pool
                    .used_bytes
                    .fetch_add(u64::from(grown), Ordering::Relaxed);
            }
            self.seal_segment(&seg);
            *active = None;
        }
    }

    fn seal_segment(&self, seg: &Segment) {
        if !seg.seal() {
            return;
        }
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.persist_sealed(seg) {
                // Keep serving from RAM; the segment just will not survive
                // a restart.
                tracing::error!(sid = seg.id(), error = %e, "failed to persist sealed segment");
            }
        }
    }

    /// Point lookup. Copies the value into `out` when it fits and returns
    /// the value length; a length greater than `out.len()` means retry
    /// with a larger buffer. `None` is a miss.
    pub fn get(&self, key: &[u8], out: &mut [u8]) -> Option<usize> {
        let info = self.index.find(key, true)?;
        if let Some(payload) = &info.embedded {
            return copy_value_from_kv(payload, key, out);
        }
        let sid = info.sid?;
        let mut scratch = self.scratch.take();
        // Skip the 8-byte expire prefix; the entry's kv_size covers the rest.
        let result = if self.data_reader.read(
            &self.pool,
            self.backend.as_ref(),
            sid,
            info.offset + 8,
            info.kv_size as usize,
            &mut scratch,
        ) {
            copy_value_from_kv(&scratch, key, out)
        } else {
            None
        };
        self.scratch.put(scratch);
        result
    }

    /// Expiration timestamp of a key, if present. 0 means never.
    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        self.index.get_expire(key)
    }

    /// Remove a key from the index. Payload bytes die with their segment.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.index.delete(key)
    }

    /// Sequential scanner over a segment's items.
    pub fn scanner(&self, sid: u16) -> CacheResult<SegmentScanner> {
        let seg = self.pool.get(sid).ok_or(CacheError::OutOfMemory)?;
        let block_size = self.data_writer.block_size();
        if let Some(scanner) = RamSegmentScanner::new(&seg, block_size) {
            return Ok(SegmentScanner::Ram(scanner));
        }
        let backend = self.backend.as_ref().ok_or(CacheError::Corrupted)?;
        Ok(SegmentScanner::File {
            buffer: backend.scanner(sid, self.prefetch_size)?,
            block_size,
        })
    }

    /// Punch a hole over a dead item range of a file segment (sparse mode).
    pub fn punch_dead_range(&self, sid: u16, offset: u32, len: usize) {
        if let Some(backend) = &self.backend {
            backend.punch_hole(sid, offset, len);
        }
    }

    /// Recycle a segment: drop its bytes, free its id, delete its file.
    pub fn release_segment(&self, sid: u16) {
        let Some(seg) = ({
            let slots = self.pool.slots.read();
            slots.get(sid as usize).cloned().flatten()
        }) else {
            return;
        };
        debug_assert!(seg.is_sealed(), "only sealed segments are recycled");
        let info = seg.info();
        seg.recycle();
        self.pool.slots.write()[sid as usize] = None;
        self.pool.free_ids.lock().push(sid);
        self.pool
            .used_bytes
            .fetch_sub(u64::from(info.used_bytes), Ordering::Relaxed);
        self.pool
            .allocated_bytes
            .fetch_sub(self.segment_size as u64, Ordering::Relaxed);
        if let Some(backend) = &self.backend {
            backend.release(sid);
        }
        tracing::debug!(sid, freed = info.used_bytes, "segment released");
    }

    /// Seal every open segment (snapshot save, shutdown).
    pub fn seal_all_active(&self) {
        for rank in 0..self.pool.active.len() {
            let mut active = self.pool.active[rank].lock();
            if let Some(seg) = active.take() {
                if seg.info().total_items == 0 {
                    // Nothing in it; return it to the free pool instead.
                    drop(active);
                    self.release_empty_open(&seg);
                    continue;
                }
                self.seal_segment(&seg);
            }
        }
    }

    fn release_empty_open(&self, seg: &Segment) {
        seg.seal();
        self.release_segment(seg.id());
    }

    // ---- persistence ----

    /// Serialize pool metadata, RAM-resident segment payloads, and the
    /// index.
    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.seal_all_active();
        put_u32(w, ENGINE_SNAPSHOT_MAGIC)?;
        put_u64(w, self.segment_size as u64)?;
        let slots = self.pool.slots.read();
        put_u32(w, slots.len() as u32)?;
        for slot in slots.iter() {
            match slot {
                None => put_u8(w, 0)?,
                Some(seg) => {
                    put_u8(w, 1)?;
                    let info = seg.info();
                    put_u16(w, info.id)?;
                    put_u32(w, info.total_items)?;
                    put_u32(w, info.total_active_items)?;
                    put_u32(w, info.used_bytes)?;
                    put_u64(w, info.max_expire_at)?;
                    put_u64(w, info.creation_time)?;
                    put_u8(w, info.state as u8)?;
                    if seg.is_ram_resident() {
                        put_u8(w, 1)?;
                        let mut buf = Vec::new();
                        seg.read_ram(0, seg.write_offset() as usize, &mut buf)
                            .expect("ram segment readable");
                        put_u32(w, buf.len() as u32)?;
                        w.write_all(&buf)?;
                    } else {
                        put_u8(w, 0)?;
                    }
                }
            }
        }
        drop(slots);
        let free = self.pool.free_ids.lock().clone();
        put_u32(w, free.len() as u32)?;
        for id in free {
            put_u16(w, id)?;
        }
        put_u64(w, self.pool.used_bytes.load(Ordering::Relaxed))?;
        put_u64(w, self.pool.allocated_bytes.load(Ordering::Relaxed))?;
        put_u64(w, self.pool.items_written.load(Ordering::Relaxed))?;
        put_u64(w, self.pool.bytes_written.load(Ordering::Relaxed))?;
        self.index.save(w)
    }

    /// Restore a snapshot written by [`StorageEngine::save`].
    pub fn load<R: Read>(&self, r: &mut R) -> io::Result<()> {
        if get_u32(r)? != ENGINE_SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad engine snapshot magic",
            ));
        }
        let segment_size = get_u64(r)? as usize;
        if segment_size != self.segment_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment size changed between save and load",
            ));
        }
        let count = get_u32(r)? as usize;
        let mut slots: Vec<Option<Arc<Segment>>> = Vec::with_capacity(count);
        for _ in 0..count {
            if get_u8(r)? == 0 {
                slots.push(None);
                continue;
            }
            let id = get_u16(r)?;
            let info = SegmentInfo {
                id,
                total_items: get_u32(r)?,
                total_active_items: get_u32(r)?,
                used_bytes: get_u32(r)?,
                max_expire_at: get_u64(r)?,
                creation_time: get_u64(r)?,
                state: match get_u8(r)? {
                    0 => SegmentState::Open,
                    1 => SegmentState::Sealed,
                    _ => SegmentState::Recycled,
                },
            };
            let seg = Segment::new(id, segment_size, info.creation_time);
            if get_u8(r)? == 1 {
                let len = get_u32(r)? as usize;
                if len > segment_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "segment payload exceeds segment size",
                    ));
                }
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)?;
                seg.restore_ram_buf(buf);
            } else {
                seg.mark_file_resident();
            }
            seg.restore_info(&info);
            slots.push(Some(Arc::new(seg)));
        }
        let free_count = get_u32(r)? as usize;
        let mut free = Vec::with_capacity(free_count);
        for _ in 0..free_count {
            free.push(get_u16(r)?);
        }
        *self.pool.slots.write() = slots;
        *self.pool.free_ids.lock() = free;
        self.pool
            .used_bytes
            .store(get_u64(r)?, Ordering::Relaxed);
        self.pool
            .allocated_bytes
            .store(get_u64(r)?, Ordering::Relaxed);
        self.pool
            .items_written
            .store(get_u64(r)?, Ordering::Relaxed);
        self.pool
            .bytes_written
            .store(get_u64(r)?, Ordering::Relaxed);
        self.index.load(r)
    }
}

/// Parse a serialized k/v region, verify the key, and copy the value out.
/// Returns the value length even when `out` is too small.
fn copy_value_from_kv(kv: &[u8], key: &[u8], out: &mut [u8]) -> Option<usize> {
    let (key_len, k_n) = read_uvarint(kv)?;
    let (value_len, v_n) = read_uvarint(&kv[k_n..])?;
    let key_len = key_len as usize;
    let value_len = value_len as usize;
    let key_start = k_n + v_n;
    let value_start = key_start + key_len;
    if value_start + value_len > kv.len() {
        return None;
    }
    // Hash collision or recycled segment: the stored key must match.
    if &kv[key_start..value_start] != key {
        return None;
    }
    if value_len <= out.len() {
        out[..value_len].copy_from_slice(&kv[value_start..value_start + value_len]);
    }
    Some(value_len)
}
