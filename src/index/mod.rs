//! The memory index: a dynamic hash table with incremental rehashing.
//!
//! The index maps 64-bit key hashes to compact per-key metadata. Slots of
//! the table each own one [`IndexBlock`]; all entries for a slot live
//! packed inside its block in SLRU order, so promotion, eviction, and
//! expiration all happen in situ under a single slot lock.
//!
//! # Slot locking
//!
//! A fixed pool of [`NUM_SLOT_LOCKS`] mutexes is mapped by `slot mod pool`.
//! Lookups use a double-check sequence to tolerate concurrent rehash:
//!
//! 1. Compute the slot against the currently observed primary table and
//!    take its lock.
//! 2. If the slot cell is populated, operate on it.
//! 3. Otherwise release, observe the rehash table (or re-observe the
//!    primary if rehashing finished under us), compute the child slot, and
//!    lock that instead.
//!
//! After acquisition exactly one of `primary[slot]` / `rehash[slot']` is
//! populated for the key's hash. The two windows where the table pair can
//! flip between observation and lock are annotated `race point 1` and
//! `race point 2` below; both resolve by retrying the sequence.
//!
//! # Incremental rehash
//!
//! When an insert cannot fit a slot's block even at the maximum ladder
//! size, that slot alone is split into two slots of a table twice the size,
//! partitioned by the next hash bit. Readers and writers keep operating on
//! unsplit slots of the old table; when the last slot splits, the new table
//! is promoted. Snapshot save forces the split of every remaining slot
//! first ([`MemoryIndex::complete_rehashing`]).

pub mod block;
pub mod format;

use std::cell::UnsafeCell;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::clock::Clock;
use crate::eviction::{EvictionPolicy, FifoPolicy};
use crate::util::{get_u32, get_u64, get_u8, hash64, put_u32, put_u64, put_u8, slot_for};
use block::{IndexBlock, BLOCK_HEADER_SIZE};
use format::{AdmissionQueueFormat, EntryInfo, IndexFormat, MainQueueFormat};

/// Size of the slot lock pool. Prime, so lock collisions do not correlate
/// with power-of-two slot patterns.
pub const NUM_SLOT_LOCKS: usize = 1117;

const INDEX_SNAPSHOT_MAGIC: u32 = 0x5443_4958; // "TCIX"

/// Result of an index mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationResult {
    /// A new entry was written.
    Inserted,
    /// An existing entry for the same hash was replaced.
    Updated,
    /// The entry was removed (`aarp` remove-if-present arm).
    Deleted,
    /// A freshly-rehashed slot overflowed before rehashing completed; the
    /// caller must surface write rejection.
    Failed,
}

/// Scavenger probe result for one item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScavengerVerdict {
    /// Entry is live and popular; the item must be rewritten.
    Ok { rank: usize, expire: u64 },
    /// Entry was dropped for low popularity; the item may move to the
    /// victim tier. Carries the entry's hit count for admission-queue
    /// readmission.
    Deleted {
        rank: usize,
        expire: u64,
        hit_count: u8,
    },
    /// Entry had expired and was dropped.
    Expired { expire: u64 },
    /// No entry for the key; the item is already dead.
    NotFound,
}

/// Receives a notification each time an index entry referencing a segment
/// is removed, so segment liveness statistics stay current.
pub trait EntryRemovalListener: Send + Sync {
    /// Called under the slot lock; must not re-enter the index.
    fn entry_removed(&self, sid: u16, expired: bool);
}

/// One table generation: a power-of-two array of slot cells.
///
/// Cells are `UnsafeCell` because mutual exclusion comes from the external
/// lock pool, not from per-cell locks. The access protocol is:
///
/// - a primary cell is read or written only while holding the pool lock
///   for its slot index;
/// - a rehash-table cell is written during its parent's split while holding
///   the *parent's* pool lock (the cell is unreachable until the parent
///   cell is observed empty, which requires that same lock), and afterwards
///   only under its own pool lock.
struct SlotArray {
    cells: Box<[UnsafeCell<Option<IndexBlock>>]>,
    level: u32,
}

// SAFETY: cells are only accessed under the protocol above, which
// guarantees exclusive access per cell.
unsafe impl Send for SlotArray {}
unsafe impl Sync for SlotArray {}

impl SlotArray {
    fn populated(level: u32) -> Self {
        let len = 1usize << level;
        let cells = (0..len)
            .map(|_| UnsafeCell::new(Some(IndexBlock::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells, level }
    }

    fn empty(level: u32) -> Self {
        let len = 1usize << level;
        let cells = (0..len)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells, level }
    }

    fn len(&self) -> usize {
        self.cells.len()
    }

    /// SAFETY: caller holds the pool lock covering `slot` per the access
    /// protocol documented on [`SlotArray`].
    #[allow(clippy::mut_from_ref)]
    unsafe fn cell(&self, slot: usize) -> &mut Option<IndexBlock> {
        &mut *self.cells[slot].get()
    }
}

struct Tables {
    primary: Arc<SlotArray>,
    rehash: Option<Arc<SlotArray>>,
}

/// A locked slot: the table generation it belongs to, the slot number, and
/// the held pool lock.
struct SlotGuard<'a> {
    array: Arc<SlotArray>,
    slot: usize,
    in_rehash_table: bool,
    _guard: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    /// SAFETY: the guard holds the pool lock for `slot`; the protocol on
    /// [`SlotArray`] makes this access exclusive.
    #[allow(clippy::mut_from_ref)]
    fn block(&self) -> &mut IndexBlock {
        unsafe { self.array.cell(self.slot) }
            .as_mut()
            .expect("locked slot must be populated")
    }
}

/// Dynamic, incrementally-rehashed hash table of compact index blocks.
pub struct MemoryIndex {
    tables: RwLock<Tables>,
    locks: Vec<Mutex<()>>,
    format: Box<dyn IndexFormat>,
    policy: Box<dyn EvictionPolicy>,
    num_ranks: usize,
    is_main: bool,
    num_entries: AtomicU64,
    max_entries: AtomicU64,
    eviction_enabled: AtomicBool,
    eviction_disabled_mode: bool,
    rehashed_slots: AtomicUsize,
    rehash_in_progress: AtomicBool,
    expired_evicted_balance: AtomicI64,
    removal_listener: Option<Arc<dyn EntryRemovalListener>>,
    clock: Arc<dyn Clock>,
}

impl MemoryIndex {
    /// Main-queue index holding full per-item metadata.
    pub fn main(
        policy: Box<dyn EvictionPolicy>,
        slots_power: u32,
        num_ranks: usize,
        eviction_disabled_mode: bool,
        removal_listener: Option<Arc<dyn EntryRemovalListener>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            Box::new(MainQueueFormat),
            policy,
            slots_power,
            num_ranks,
            true,
            eviction_disabled_mode,
            removal_listener,
            clock,
        )
    }

    /// Admission-queue index: bare hashes, FIFO order, size-capped.
    pub fn admission(slots_power: u32, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Box::new(AdmissionQueueFormat),
            Box::new(FifoPolicy),
            slots_power,
            1,
            false,
            false,
            None,
            clock,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        format: Box<dyn IndexFormat>,
        policy: Box<dyn EvictionPolicy>,
        slots_power: u32,
        num_ranks: usize,
        is_main: bool,
        eviction_disabled_mode: bool,
        removal_listener: Option<Arc<dyn EntryRemovalListener>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = (0..NUM_SLOT_LOCKS).map(|_| Mutex::new(())).collect();
        Self {
            tables: RwLock::new(Tables {
                primary: Arc::new(SlotArray::populated(slots_power)),
                rehash: None,
            }),
            locks,
            format,
            policy,
            num_ranks,
            is_main,
            num_entries: AtomicU64::new(0),
            max_entries: AtomicU64::new(0),
            eviction_enabled: AtomicBool::new(false),
            eviction_disabled_mode,
            rehashed_slots: AtomicUsize::new(0),
            rehash_in_progress: AtomicBool::new(false),
            expired_evicted_balance: AtomicI64::new(0),
            removal_listener,
            clock,
        }
    }

    /// Total number of entries across all slots.
    pub fn len(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Credits accumulated by proactive expiration, spendable by eviction.
    pub fn expired_evicted_balance(&self) -> i64 {
        self.expired_evicted_balance.load(Ordering::Relaxed)
    }

    /// Maximum entry count (admission queue sizing); 0 means unbounded.
    pub fn max_entries(&self) -> u64 {
        self.max_entries.load(Ordering::Relaxed)
    }

    /// Set the maximum entry count. Eviction engages once the index is at
    /// or above the cap.
    pub fn set_max_entries(&self, max: u64) {
        self.max_entries.store(max, Ordering::Relaxed);
    }

    /// Force in-block eviction on or off for a main index.
    pub fn set_eviction_enabled(&self, enabled: bool) {
        self.eviction_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether a rehash is currently in progress.
    pub fn is_rehashing(&self) -> bool {
        self.rehash_in_progress.load(Ordering::Acquire)
    }

    /// Current number of primary slots (tests and sizing heuristics).
    pub fn num_slots(&self) -> usize {
        self.tables.read().primary.len()
    }

    fn eviction_on(&self) -> bool {
        if self.eviction_disabled_mode {
            return false;
        }
        if self.is_main {
            return self.eviction_enabled.load(Ordering::Relaxed);
        }
        let max = self.max_entries.load(Ordering::Relaxed);
        max > 0 && self.num_entries.load(Ordering::Relaxed) >= max
    }

    // ---- slot locking protocol ----

    fn lock_slot(&self, hash: u64) -> SlotGuard<'_> {
        loop {
            let primary = self.tables.read().primary.clone();
            let slot = slot_for(hash, primary.level);
            let guard = self.locks[slot % NUM_SLOT_LOCKS].lock();
            // SAFETY: pool lock for `slot` is held.
            if unsafe { primary.cell(slot) }.is_some() {
                return SlotGuard {
                    array: primary,
                    slot,
                    in_rehash_table: false,
                    _guard: guard,
                };
            }
            drop(guard);
            // race point 1: the table pair may flip before the next read.
            let (array, in_rehash_table) = {
                let tables = self.tables.read();
                match &tables.rehash {
                    Some(r) => (r.clone(), true),
                    None => (tables.primary.clone(), false),
                }
            };
            let slot = slot_for(hash, array.level);
            let guard = self.locks[slot % NUM_SLOT_LOCKS].lock();
            // race point 2: rehashing may have completed (or a deeper one
            // begun) between the observation above and this lock.
            // SAFETY: pool lock for `slot` is held.
            if unsafe { array.cell(slot) }.is_some() {
                return SlotGuard {
                    array,
                    slot,
                    in_rehash_table,
                    _guard: guard,
                };
            }
            drop(guard);
        }
    }

    // ---- entry walking helpers (all called under a slot lock) ----

    fn entry_len_at(&self, block: &IndexBlock, offset: usize) -> usize {
        self.format.entry_size(&block.body()[offset..])
    }

    /// Byte offset of the entry at position `index`.
    fn offset_of_index(&self, block: &IndexBlock, index: usize) -> usize {
        let mut offset = 0;
        for _ in 0..index {
            offset += self.entry_len_at(block, offset);
        }
        offset
    }

    /// Locate the first entry matching `hash`: `(byte_offset, len, position)`.
    fn locate(&self, block: &IndexBlock, hash: u64) -> Option<(usize, usize, usize)> {
        let mut offset = 0;
        for position in 0..block.num_entries() as usize {
            let len = self.entry_len_at(block, offset);
            if self.format.hash_of(&block.body()[offset..offset + len]) == hash {
                return Some((offset, len, position));
            }
            offset += len;
        }
        None
    }

    fn remove_at(&self, block: &mut IndexBlock, offset: usize, len: usize, expired: bool) {
        if let Some(listener) = &self.removal_listener {
            if let Some(info) = self.format.decode(&block.body()[offset..offset + len]) {
                if let Some(sid) = info.sid {
                    listener.entry_removed(sid, expired);
                }
            }
        }
        block.remove_entry_at(offset, len);
        self.num_entries.fetch_sub(1, Ordering::Relaxed);
    }

    /// Sweep expired entries out of the block. Returns the number removed.
    fn sweep_expired(&self, block: &mut IndexBlock, now: u64) -> usize {
        if !self.format.expiration_supported() {
            return 0;
        }
        let mut removed = 0;
        let mut offset = 0;
        let mut position = 0;
        while position < block.num_entries() as usize {
            let len = self.entry_len_at(block, offset);
            let expire = self.format.expire_of(&block.body()[offset..offset + len]);
            if expire > 0 && now > expire {
                self.remove_at(block, offset, len, true);
                self.expired_evicted_balance.fetch_add(1, Ordering::Relaxed);
                removed += 1;
                continue;
            }
            offset += len;
            position += 1;
        }
        removed
    }

    fn find_expired_index(&self, block: &IndexBlock, now: u64) -> Option<(usize, usize)> {
        if !self.format.expiration_supported() {
            return None;
        }
        let mut offset = 0;
        for _ in 0..block.num_entries() as usize {
            let len = self.entry_len_at(block, offset);
            let expire = self.format.expire_of(&block.body()[offset..offset + len]);
            if expire > 0 && now > expire {
                return Some((offset, len));
            }
            offset += len;
        }
        None
    }

    fn evict_one(&self, block: &mut IndexBlock, now: u64) {
        let n = block.num_entries() as usize;
        if n == 0 {
            return;
        }
        let (offset, len) = self.find_expired_index(block, now).unwrap_or_else(|| {
            let victim = self.policy.eviction_candidate(n);
            let offset = self.offset_of_index(block, victim);
            (offset, self.entry_len_at(block, offset))
        });
        self.remove_at(block, offset, len, false);
    }

    fn delete_in_block(&self, block: &mut IndexBlock, hash: u64) -> Option<usize> {
        let (offset, len, position) = self.locate(block, hash)?;
        self.remove_at(block, offset, len, false);
        Some(position)
    }

    // ---- public operations ----

    /// Look up a key, optionally recording a hit and promoting the entry
    /// one virtual SLRU segment. Expired entries encountered during the
    /// scan are removed.
    pub fn find(&self, key: &[u8], promote: bool) -> Option<EntryInfo> {
        debug_assert!(self.is_main);
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        self.sweep_expired(block, self.clock.now_millis());

        let (offset, len, position) = self.locate(block, hash)?;
        if promote {
            self.format.hit(block.entry_mut(offset, len));
        }
        let info = self.format.decode(&block.body()[offset..offset + len]);
        if promote && position > 0 {
            let n = block.num_entries() as usize;
            let target = self.policy.promotion_index(position, n);
            if target < position {
                let target_offset = self.offset_of_index(block, target);
                block.move_entry(offset, len, target_offset);
            }
        }
        info
    }

    /// Expiration timestamp of a key's entry. `Some(0)` means never.
    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        let (offset, len, _) = self.locate(block, hash)?;
        Some(self.format.expire_of(&block.body()[offset..offset + len]))
    }

    /// Hit counter of a key's entry.
    pub fn hit_count(&self, key: &[u8]) -> Option<u8> {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        let (offset, len, _) = self.locate(block, hash)?;
        self.format
            .decode(&block.body()[offset..offset + len])
            .map(|info| info.hit_count)
    }

    /// Insert a main-queue entry pointing at a stored item.
    pub fn insert(
        &self,
        key: &[u8],
        sid: u16,
        offset: u32,
        kv_size: u32,
        expire: u64,
        rank: Option<usize>,
    ) -> MutationResult {
        debug_assert!(self.is_main);
        let hash = hash64(key);
        let mut entry = Vec::with_capacity(format::MQ_ENTRY_SIZE);
        MainQueueFormat::encode(&mut entry, hash, sid, offset, kv_size, expire);
        self.insert_encoded(hash, &entry, rank)
    }

    /// Insert a main-queue entry with the serialized item embedded.
    pub fn insert_embedded(
        &self,
        key: &[u8],
        payload: &[u8],
        expire: u64,
        rank: Option<usize>,
    ) -> MutationResult {
        debug_assert!(self.is_main);
        let hash = hash64(key);
        let mut entry = Vec::with_capacity(format::MQ_ENTRY_SIZE + payload.len());
        MainQueueFormat::encode_embedded(&mut entry, hash, payload, expire);
        self.insert_encoded(hash, &entry, rank)
    }

    fn insert_encoded(&self, hash: u64, entry: &[u8], rank: Option<usize>) -> MutationResult {
        let rank = rank
            .unwrap_or_else(|| self.policy.default_insert_rank())
            .min(self.num_ranks - 1);
        let guard = self.lock_slot(hash);
        self.insert_under_lock(&guard, hash, entry, rank)
    }

    fn insert_under_lock(
        &self,
        guard: &SlotGuard<'_>,
        hash: u64,
        entry: &[u8],
        rank: usize,
    ) -> MutationResult {
        let block = guard.block();
        let now = self.clock.now_millis();
        if self.format.begin_scan() {
            self.sweep_expired(block, now);
        }

        let previous = self.delete_in_block(block, hash);
        if previous.is_none() && self.eviction_on() {
            let balance = self.expired_evicted_balance.load(Ordering::Relaxed);
            if balance > 0 {
                self.expired_evicted_balance.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.evict_one(block, now);
            }
        }

        if !block.fits(entry.len()) {
            let required = BLOCK_HEADER_SIZE + block.data_size() as usize + entry.len();
            if !block.grow_to(required) {
                if guard.in_rehash_table {
                    tracing::warn!("insert failed: rehash slot overflow");
                    return MutationResult::Failed;
                }
                return self.rehash_and_insert(guard, hash, entry, rank, previous);
            }
        }

        self.insert_positioned(block, entry, rank, previous);
        if previous.is_some() {
            MutationResult::Updated
        } else {
            MutationResult::Inserted
        }
    }

    fn insert_positioned(
        &self,
        block: &mut IndexBlock,
        entry: &[u8],
        rank: usize,
        previous: Option<usize>,
    ) {
        let n = block.num_entries() as usize;
        let index = match previous {
            // An update keeps its SLRU position rather than re-entering at
            // the insert point.
            Some(p) if self.is_main => p.min(n),
            _ => self.policy.insert_index(rank, n),
        };
        let offset = self.offset_of_index(block, index);
        block.insert_entry_at(offset, entry);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Split the locked primary slot into the rehash table and insert the
    /// pending entry into the proper child.
    fn rehash_and_insert(
        &self,
        guard: &SlotGuard<'_>,
        hash: u64,
        entry: &[u8],
        rank: usize,
        previous: Option<usize>,
    ) -> MutationResult {
        let rehash = self.split_slot_locked(guard);

        let child = slot_for(hash, rehash.level);
        // SAFETY: the parent's pool lock (held by `guard`) still guards the
        // children: they only become reachable to other threads once the
        // parent cell is observed empty, which requires the parent's lock.
        let block = unsafe { rehash.cell(child) }
            .as_mut()
            .expect("split must populate both children");

        let mut result = MutationResult::Failed;
        let fits = block.fits(entry.len()) || {
            let required = BLOCK_HEADER_SIZE + block.data_size() as usize + entry.len();
            block.grow_to(required)
        };
        if fits {
            self.insert_positioned(block, entry, rank, None);
            result = if previous.is_some() {
                MutationResult::Updated
            } else {
                MutationResult::Inserted
            };
        } else {
            tracing::warn!("insert failed: child slot overflow immediately after split");
        }

        self.finish_slot_rehash(guard.array.len());
        result
    }

    /// Split the locked slot's block into its two children in the rehash
    /// table, emptying the primary cell. Returns the rehash table.
    fn split_slot_locked(&self, guard: &SlotGuard<'_>) -> Arc<SlotArray> {
        self.rehash_in_progress.store(true, Ordering::Release);
        let rehash = {
            let mut tables = self.tables.write();
            if tables.rehash.is_none() {
                tables.rehash = Some(Arc::new(SlotArray::empty(tables.primary.level + 1)));
                tracing::debug!(
                    slots = tables.primary.len() * 2,
                    "index rehash started"
                );
            }
            tables.rehash.clone().unwrap()
        };

        // SAFETY: pool lock for the slot is held by `guard`.
        let block = unsafe { guard.array.cell(guard.slot) }
            .take()
            .expect("splitting an empty slot");

        let mut body0 = Vec::new();
        let mut body1 = Vec::new();
        let mut count0 = 0u16;
        let mut count1 = 0u16;
        let mut offset = 0;
        for _ in 0..block.num_entries() as usize {
            let len = self.entry_len_at(&block, offset);
            let bytes = &block.body()[offset..offset + len];
            let bit = (self.format.hash_of(bytes) >> (64 - rehash.level)) & 1;
            if bit == 0 {
                body0.extend_from_slice(bytes);
                count0 += 1;
            } else {
                body1.extend_from_slice(bytes);
                count1 += 1;
            }
            offset += len;
        }

        let child0 = guard.slot * 2;
        // SAFETY: children of a splitting slot are unreachable to other
        // threads until the parent cell above is observed empty, which
        // requires the parent's pool lock held by `guard`.
        unsafe {
            *rehash.cell(child0) = Some(IndexBlock::from_entries(&body0, count0));
            *rehash.cell(child0 + 1) = Some(IndexBlock::from_entries(&body1, count1));
        }
        rehash
    }

    /// Account one completed slot split; promote the rehash table when all
    /// primary slots are done.
    fn finish_slot_rehash(&self, primary_len: usize) {
        let done = self.rehashed_slots.fetch_add(1, Ordering::AcqRel) + 1;
        if done == primary_len {
            let mut tables = self.tables.write();
            let rehash = tables.rehash.take().expect("rehash table missing at promotion");
            tables.primary = rehash;
            self.rehashed_slots.store(0, Ordering::Release);
            self.rehash_in_progress.store(false, Ordering::Release);
            tracing::debug!(slots = tables.primary.len(), "index rehash complete");
        }
    }

    /// Force any in-progress rehash to completion. Called before snapshot
    /// save; assumes mutating traffic is quiesced.
    pub fn complete_rehashing(&self) {
        while self.is_rehashing() {
            let primary = self.tables.read().primary.clone();
            let mut progressed = false;
            for slot in 0..primary.len() {
                let guard = self.locks[slot % NUM_SLOT_LOCKS].lock();
                // SAFETY: pool lock for `slot` is held.
                if unsafe { primary.cell(slot) }.is_some() {
                    let slot_guard = SlotGuard {
                        array: primary.clone(),
                        slot,
                        in_rehash_table: false,
                        _guard: guard,
                    };
                    self.split_slot_locked(&slot_guard);
                    self.finish_slot_rehash(primary.len());
                    progressed = true;
                }
            }
            if !progressed {
                std::thread::yield_now();
            }
        }
    }

    /// Delete a key's entry.
    pub fn delete(&self, key: &[u8]) -> bool {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        let removed = self.delete_in_block(block, hash).is_some();
        if removed {
            block.shrink_to_fit();
        }
        removed
    }

    /// Atomic add-if-absent / remove-if-present, used by the admission
    /// queue's ghost tracking.
    pub fn aarp(&self, key: &[u8]) -> MutationResult {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        if self.delete_in_block(block, hash).is_some() {
            block.shrink_to_fit();
            return MutationResult::Deleted;
        }
        let mut entry = Vec::with_capacity(format::AQ_ENTRY_SIZE);
        AdmissionQueueFormat::encode(&mut entry, hash);
        self.insert_under_lock(&guard, hash, &entry, 0)
    }

    /// Scavenger probe: classify the entry for `key` and delete it when it
    /// is expired or falls at or below the dump-below popularity threshold.
    ///
    /// The probe only matches an entry that still points at `(sid, offset)`,
    /// the location the scavenger found the item at. An entry elsewhere
    /// means the scanned bytes are a stale copy (the key was updated or
    /// relocated) and the verdict is `NotFound`, so stale values are never
    /// rewritten over newer ones.
    pub fn check_delete_for_scavenger(
        &self,
        key: &[u8],
        sid: u16,
        location: u32,
        dump_below: f64,
    ) -> ScavengerVerdict {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        let Some((offset, len, position)) = self.locate(block, hash) else {
            return ScavengerVerdict::NotFound;
        };
        let entry = &block.body()[offset..offset + len];
        let Some(info) = self.format.decode(entry) else {
            return ScavengerVerdict::NotFound;
        };
        if info.sid != Some(sid) || info.offset != location {
            return ScavengerVerdict::NotFound;
        }
        let n = block.num_entries() as usize;
        let expire = info.expire;
        let rank = self.policy.rank_for_index(position, n);
        let now = self.clock.now_millis();
        if expire > 0 && now > expire {
            self.remove_at(block, offset, len, true);
            self.expired_evicted_balance.fetch_add(1, Ordering::Relaxed);
            return ScavengerVerdict::Expired { expire };
        }
        let popularity = (n - position) as f64 / n as f64;
        if popularity <= dump_below {
            self.remove_at(block, offset, len, false);
            ScavengerVerdict::Deleted {
                rank,
                expire,
                hit_count: info.hit_count,
            }
        } else {
            ScavengerVerdict::Ok { rank, expire }
        }
    }

    /// Rewrite the storage location of a key's entry in place, preserving
    /// its SLRU position and hit count. Used by the scavenger after moving
    /// an item to a fresh segment.
    pub fn update_location(&self, key: &[u8], sid: u16, offset: u32) -> bool {
        let hash = hash64(key);
        let guard = self.lock_slot(hash);
        let block = guard.block();
        let Some((entry_offset, len, _)) = self.locate(block, hash) else {
            return false;
        };
        self.format
            .set_location(block.entry_mut(entry_offset, len), sid, offset);
        true
    }

    // ---- persistence ----

    /// Serialize the index: counters, then every slot's block image.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.complete_rehashing();
        put_u32(w, INDEX_SNAPSHOT_MAGIC)?;
        put_u64(w, self.num_entries.load(Ordering::Relaxed))?;
        put_u64(w, self.max_entries.load(Ordering::Relaxed))?;
        put_u8(w, self.eviction_enabled.load(Ordering::Relaxed) as u8)?;
        put_u64(w, self.expired_evicted_balance.load(Ordering::Relaxed) as u64)?;
        let primary = self.tables.read().primary.clone();
        put_u32(w, primary.level)?;
        for slot in 0..primary.len() {
            let _guard = self.locks[slot % NUM_SLOT_LOCKS].lock();
            // SAFETY: pool lock for `slot` is held.
            let block = unsafe { primary.cell(slot) }
                .as_ref()
                .expect("slot empty after complete_rehashing");
            let bytes = block.as_bytes();
            put_u32(w, bytes.len() as u32)?;
            w.write_all(bytes)?;
        }
        Ok(())
    }

    /// Restore an index previously written by [`MemoryIndex::save`].
    pub fn load<R: Read + ?Sized>(&self, r: &mut R) -> io::Result<()> {
        if get_u32(r)? != INDEX_SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad index snapshot magic",
            ));
        }
        let num_entries = get_u64(r)?;
        let max_entries = get_u64(r)?;
        let eviction_enabled = get_u8(r)? != 0;
        let balance = get_u64(r)? as i64;
        let level = get_u32(r)?;
        if level == 0 || level > 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad index snapshot level",
            ));
        }
        let array = SlotArray::empty(level);
        for slot in 0..array.len() {
            let len = get_u32(r)? as usize;
            if len < BLOCK_HEADER_SIZE || len > block::max_block_size() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad index block length",
                ));
            }
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            let block = IndexBlock::from_bytes(buf).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "bad index block image")
            })?;
            // SAFETY: the array is not yet shared.
            unsafe { *array.cell(slot) = Some(block) };
        }
        let mut tables = self.tables.write();
        tables.primary = Arc::new(array);
        tables.rehash = None;
        drop(tables);
        self.num_entries.store(num_entries, Ordering::Relaxed);
        self.max_entries.store(max_entries, Ordering::Relaxed);
        self.eviction_enabled
            .store(eviction_enabled, Ordering::Relaxed);
        self.expired_evicted_balance
            .store(balance, Ordering::Relaxed);
        self.rehashed_slots.store(0, Ordering::Relaxed);
        self.rehash_in_progress.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eviction::SlruPolicy;
    use std::sync::atomic::AtomicUsize;

    fn test_index(slots_power: u32) -> (MemoryIndex, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let policy = Box::new(SlruPolicy::new(8, 4, 8));
        let index = MemoryIndex::main(policy, slots_power, 8, false, None, clock.clone());
        (index, clock)
    }

    #[test]
    fn test_insert_find_delete() {
        let (index, _) = test_index(4);
        assert_eq!(
            index.insert(b"alpha", 3, 128, 10, 0, None),
            MutationResult::Inserted
        );
        assert_eq!(index.len(), 1);

        let info = index.find(b"alpha", false).unwrap();
        assert_eq!(info.sid, Some(3));
        assert_eq!(info.offset, 128);
        assert_eq!(info.kv_size, 10);
        assert_eq!(info.expire, 0);

        assert!(index.find(b"beta", false).is_none());
        assert!(index.delete(b"alpha"));
        assert!(!index.delete(b"alpha"));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_insert_twice_is_update() {
        let (index, _) = test_index(4);
        assert_eq!(
            index.insert(b"k", 1, 0, 4, 0, None),
            MutationResult::Inserted
        );
        assert_eq!(
            index.insert(b"k", 2, 64, 6, 0, None),
            MutationResult::Updated
        );
        assert_eq!(index.len(), 1);
        let info = index.find(b"k", false).unwrap();
        assert_eq!(info.sid, Some(2));
        assert_eq!(info.offset, 64);
    }

    #[test]
    fn test_hit_counting_and_promotion() {
        let (index, _) = test_index(1);
        // One slot (power 1 -> 2 slots); load enough entries to make
        // position movement observable.
        for i in 0..60u32 {
            let key = format!("key-{i}");
            index.insert(key.as_bytes(), 0, i, 8, 0, Some(7));
        }
        let probe = b"key-10";
        assert_eq!(index.hit_count(probe), Some(0));
        index.find(probe, true);
        assert_eq!(index.hit_count(probe), Some(1));
        index.find(probe, true);
        assert_eq!(index.hit_count(probe), Some(2));
    }

    #[test]
    fn test_expired_entries_swept_on_find() {
        let (index, clock) = test_index(4);
        index.insert(b"stale", 0, 0, 4, 1_000_050, None);
        index.insert(b"fresh", 0, 8, 4, 0, None);
        assert_eq!(index.len(), 2);

        clock.advance(100);
        // Any find against the slot sweeps the expired entry.
        assert!(index.find(b"stale", false).is_none());
        assert_eq!(index.expired_evicted_balance(), 1);
        assert_eq!(index.len(), 1);
        // Only counted once.
        assert!(index.find(b"stale", false).is_none());
        assert_eq!(index.expired_evicted_balance(), 1);
    }

    #[test]
    fn test_rehash_no_lost_keys() {
        let (index, _) = test_index(1);
        let n = 4000u32;
        for i in 0..n {
            let key = format!("key-{i:06}");
            let result = index.insert(key.as_bytes(), (i % 100) as u16, i, 16, 0, None);
            assert_ne!(result, MutationResult::Failed, "insert {i} failed");
        }
        assert_eq!(index.len(), n as u64);
        assert!(index.num_slots() > 2, "rehash should have grown the table");
        for i in 0..n {
            let key = format!("key-{i:06}");
            let info = index.find(key.as_bytes(), false).unwrap();
            assert_eq!(info.offset, i);
        }
    }

    #[test]
    fn test_find_during_rehash() {
        let (index, _) = test_index(1);
        // Insert until a rehash is mid-flight, then verify lookups in both
        // split and unsplit slots resolve.
        let mut i = 0u32;
        while !index.is_rehashing() {
            let key = format!("key-{i:06}");
            index.insert(key.as_bytes(), 0, i, 16, 0, None);
            i += 1;
            assert!(i < 100_000, "rehash never started");
        }
        for j in 0..i {
            let key = format!("key-{j:06}");
            let info = index.find(key.as_bytes(), false).unwrap();
            assert_eq!(info.offset, j);
        }
        assert!(index.is_rehashing());
        index.complete_rehashing();
        assert!(!index.is_rehashing());
        for j in 0..i {
            let key = format!("key-{j:06}");
            assert!(index.find(key.as_bytes(), false).is_some());
        }
    }

    #[test]
    fn test_aarp() {
        let clock = Arc::new(ManualClock::new(0));
        let index = MemoryIndex::admission(4, clock);
        assert_eq!(index.aarp(b"x"), MutationResult::Inserted);
        assert_eq!(index.len(), 1);
        assert_eq!(index.aarp(b"x"), MutationResult::Deleted);
        assert_eq!(index.len(), 0);
        assert_eq!(index.aarp(b"x"), MutationResult::Inserted);
    }

    #[test]
    fn test_aq_eviction_at_cap() {
        let clock = Arc::new(ManualClock::new(0));
        let index = MemoryIndex::admission(1, clock);
        index.set_max_entries(10);
        for i in 0..50u32 {
            index.aarp(format!("k{i}").as_bytes());
        }
        // The FIFO cap keeps the queue near its maximum instead of growing
        // without bound. Per-slot eviction can overshoot by a couple of
        // entries when the insert lands in a near-empty slot.
        assert!(index.len() <= 13, "len = {}", index.len());
    }

    #[test]
    fn test_check_delete_for_scavenger() {
        let (index, clock) = test_index(1);
        for i in 0..100u32 {
            index.insert(format!("key-{i:03}").as_bytes(), 0, i, 8, 0, Some(7));
        }
        // Unknown key.
        assert_eq!(
            index.check_delete_for_scavenger(b"nope", 0, 0, 0.1),
            ScavengerVerdict::NotFound
        );

        // A probe from a stale location is not a match: the entry stays.
        assert_eq!(
            index.check_delete_for_scavenger(b"key-050", 0, 999, 1.0),
            ScavengerVerdict::NotFound
        );
        assert!(index.find(b"key-050", false).is_some());

        // dump_below = 1.0 dumps everything it probes.
        let verdict = index.check_delete_for_scavenger(b"key-050", 0, 50, 1.0);
        assert!(matches!(verdict, ScavengerVerdict::Deleted { .. }));
        assert!(index.find(b"key-050", false).is_none());

        // dump_below = 0.0 keeps everything.
        let verdict = index.check_delete_for_scavenger(b"key-051", 0, 51, 0.0);
        assert!(matches!(verdict, ScavengerVerdict::Ok { .. }));
        assert!(index.find(b"key-051", false).is_some());

        // Expired entries report Expired and bump the balance.
        index.insert(b"dying", 3, 0, 8, clock.now_millis() + 10, None);
        clock.advance(100);
        let before = index.expired_evicted_balance();
        let verdict = index.check_delete_for_scavenger(b"dying", 3, 0, 0.0);
        assert!(matches!(verdict, ScavengerVerdict::Expired { .. }));
        assert_eq!(index.expired_evicted_balance(), before + 1);
    }

    #[test]
    fn test_update_location() {
        let (index, _) = test_index(4);
        index.insert(b"moved", 1, 100, 8, 77, None);
        index.find(b"moved", true);
        assert!(index.update_location(b"moved", 9, 4096));
        let info = index.find(b"moved", false).unwrap();
        assert_eq!(info.sid, Some(9));
        assert_eq!(info.offset, 4096);
        // Expire and hit count survive the relocation.
        assert_eq!(info.expire, 77);
        assert_eq!(info.hit_count, 1);
        assert!(!index.update_location(b"absent", 1, 2));
    }

    #[test]
    fn test_removal_listener_notified() {
        struct Counter(AtomicUsize, AtomicUsize);
        impl EntryRemovalListener for Counter {
            fn entry_removed(&self, _sid: u16, expired: bool) {
                self.0.fetch_add(1, Ordering::Relaxed);
                if expired {
                    self.1.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let listener = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
        let clock = Arc::new(ManualClock::new(1000));
        let policy = Box::new(SlruPolicy::new(8, 4, 8));
        let index = MemoryIndex::main(
            policy,
            4,
            8,
            false,
            Some(listener.clone()),
            clock.clone(),
        );

        index.insert(b"a", 5, 0, 4, 0, None);
        index.delete(b"a");
        assert_eq!(listener.0.load(Ordering::Relaxed), 1);
        assert_eq!(listener.1.load(Ordering::Relaxed), 0);

        index.insert(b"b", 5, 8, 4, 2000, None);
        clock.advance(5000);
        index.find(b"b", false);
        assert_eq!(listener.0.load(Ordering::Relaxed), 2);
        assert_eq!(listener.1.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (index, _) = test_index(2);
        for i in 0..500u32 {
            index.insert(format!("key-{i:04}").as_bytes(), 2, i * 32, 24, 0, None);
        }
        let balance_before = index.expired_evicted_balance();
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();

        let (restored, _) = test_index(2);
        restored.load(&mut &buf[..]).unwrap();
        assert_eq!(restored.len(), 500);
        assert_eq!(restored.expired_evicted_balance(), balance_before);
        for i in 0..500u32 {
            let info = restored.find(format!("key-{i:04}").as_bytes(), false).unwrap();
            assert_eq!(info.offset, i * 32);
        }
    }

    #[test]
    fn test_save_forces_rehash_completion() {
        let (index, _) = test_index(1);
        let mut i = 0u32;
        while !index.is_rehashing() {
            index.insert(format!("key-{i:06}").as_bytes(), 0, i, 16, 0, None);
            i += 1;
        }
        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();
        assert!(!index.is_rehashing());

        let (restored, _) = test_index(1);
        restored.load(&mut &buf[..]).unwrap();
        for j in 0..i {
            assert!(restored.find(format!("key-{j:06}").as_bytes(), false).is_some());
        }
    }

    #[test]
    fn test_concurrent_inserts_and_finds() {
        use std::thread;
        let (index, _) = test_index(1);
        let index = Arc::new(index);
        let threads = 8;
        let per_thread = 600u32;
        let mut handles = Vec::new();
        for t in 0..threads {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t}-key-{i:05}");
                    let result = index.insert(key.as_bytes(), t as u16, i, 16, 0, None);
                    assert_ne!(result, MutationResult::Failed);
                    assert!(index.find(key.as_bytes(), true).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), (threads as u64) * (per_thread as u64));
        for t in 0..threads {
            for i in 0..per_thread {
                let key = format!("t{t}-key-{i:05}");
                assert!(index.find(key.as_bytes(), false).is_some(), "{key} lost");
            }
        }
    }
}
