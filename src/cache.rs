//! The cache facade.
//!
//! [`Cache`] composes the storage engine, memory index, admission policy,
//! scavenger, and throughput controller behind the narrow public contract:
//! `put` / `get` / `delete` / `expire`, plus snapshot `save` / `load`.
//!
//! A RAM cache may own one victim (file) cache. On a main-tier miss the
//! lookup falls through to the victim; a victim hit is written back into
//! the main tier and removed from the victim when promotion is enabled.
//! The victim is owned one-way: nothing in the victim points back at its
//! parent, and all promotion runs in the parent's `get` path.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::admission::{AdmissionPolicy, AdmissionPolicyKind};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, CacheKind, ConfigFile};
use crate::error::{CacheError, CacheResult};
use crate::recycling::RecyclingSelectorKind;
use crate::scavenger::{
    DumpRatio, Scavenger, ScavengerSignal, ScavengerStats, StallControl, VictimSink,
};
use crate::scheduler::Scheduler;
use crate::storage::StorageEngine;
use crate::throughput::ThroughputController;
use crate::util::{get_u32, get_u64, put_u32, put_u64};

const CACHE_SNAPSHOT_MAGIC: u32 = 0x5443_4348; // "TCCH"

const CACHE_SNAPSHOT_NAME: &str = "cache.data";
const ENGINE_SNAPSHOT_NAME: &str = "engine.data";
const THROUGHPUT_SNAPSHOT_NAME: &str = "tc.data";
const RECYCLING_SNAPSHOT_NAME: &str = "rc.data";
const ADMISSION_SNAPSHOT_NAME: &str = "aq.data";
const SCAVENGER_SNAPSHOT_NAME: &str = "scav.data";

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    rejected_writes: AtomicU64,
}

/// Point-in-time statistics of one cache tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub gets: u64,
    pub hits: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub items: u64,
    pub used_bytes: u64,
    pub allocated_bytes: u64,
    pub expired_evicted_balance: i64,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`; 0 before any gets.
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.hits as f64 / self.gets as f64
        }
    }
}

struct CacheShared {
    cfg: CacheConfig,
    engine: Arc<StorageEngine>,
    admission: Option<Arc<dyn AdmissionPolicy>>,
    throughput: Arc<ThroughputController>,
    dump_ratio: Arc<DumpRatio>,
    scavenger: Arc<Scavenger>,
    scav_signal: Arc<ScavengerSignal>,
    scav_stats: Arc<ScavengerStats>,
    stall: Arc<StallControl>,
    victim: RwLock<Option<Cache>>,
    counters: Counters,
    epoch: AtomicU64,
    clock: Arc<dyn Clock>,
    shutdown: AtomicBool,
    scheduler: Mutex<Option<Scheduler>>,
    scav_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Multi-tier, scan-resistant key/value cache handle. Cheap to clone; all
/// clones share one cache.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<CacheShared>,
}

/// Transfers scavenger-evicted items into the victim tier.
struct VictimTransfer {
    victim: Cache,
}

impl VictimSink for VictimTransfer {
    fn transfer(&self, key: &[u8], value: &[u8], expire: u64) {
        let rank = self.victim.shared.cfg.slru_insert_point;
        if let Err(e) = self.victim.put_with_rank(key, value, expire, rank, true) {
            tracing::debug!(error = %e, "victim transfer rejected");
        }
    }
}

/// Builder wiring a cache instance from a validated configuration.
pub struct CacheBuilder {
    cfg: CacheConfig,
    admission: AdmissionPolicyKind,
    recycling: RecyclingSelectorKind,
    clock: Arc<dyn Clock>,
    victim: Option<Cache>,
    background: bool,
}

impl CacheBuilder {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            admission: AdmissionPolicyKind::None,
            recycling: RecyclingSelectorKind::default(),
            clock: Arc::new(SystemClock),
            victim: None,
            background: true,
        }
    }

    /// Select the admission policy.
    pub fn admission(mut self, kind: AdmissionPolicyKind) -> Self {
        self.admission = kind;
        self
    }

    /// Select the recycling selector.
    pub fn recycling(mut self, kind: RecyclingSelectorKind) -> Self {
        self.recycling = kind;
        self
    }

    /// Inject a time source (tests use [`crate::clock::ManualClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an already-built victim cache.
    pub fn victim(mut self, victim: Cache) -> Self {
        self.victim = Some(victim);
        self
    }

    /// Disable the background scavenger/scheduler threads. Tests drive
    /// [`Cache::run_scavenger_once`] directly instead.
    pub fn background(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub fn build(self) -> CacheResult<Cache> {
        self.cfg.validate()?;
        if let Some(victim) = &self.victim {
            if self.cfg.kind != CacheKind::Offheap {
                return Err(CacheError::Config(
                    "only a RAM cache may have a victim cache".to_string(),
                ));
            }
            if victim.shared.victim.read().is_some() {
                return Err(CacheError::Config(
                    "a victim cache may not have its own victim".to_string(),
                ));
            }
        }

        let clock = self.clock;
        let engine = Arc::new(StorageEngine::new(&self.cfg, clock.clone())?);
        let admission = self.admission.build(&self.cfg, clock.clone());
        let dump_ratio = Arc::new(DumpRatio::from_config(&self.cfg));
        let scav_stats = Arc::new(ScavengerStats::default());
        let stall = Arc::new(StallControl::default());
        let scav_signal = Arc::new(ScavengerSignal::default());
        let scavenger = Arc::new(Scavenger::new(
            &self.cfg,
            engine.clone(),
            self.recycling.build(),
            dump_ratio.clone(),
            scav_stats.clone(),
            stall.clone(),
            admission.clone(),
            clock.clone(),
        ));
        let throughput = Arc::new(ThroughputController::new(
            &self.cfg,
            admission.clone(),
            dump_ratio.clone(),
            clock.clone(),
        ));

        let shared = Arc::new(CacheShared {
            epoch: AtomicU64::new(clock.now_millis()),
            cfg: self.cfg,
            engine,
            admission,
            throughput,
            dump_ratio,
            scavenger,
            scav_signal,
            scav_stats,
            stall,
            victim: RwLock::new(None),
            counters: Counters::default(),
            clock,
            shutdown: AtomicBool::new(false),
            scheduler: Mutex::new(None),
            scav_thread: Mutex::new(None),
        });
        let cache = Cache { shared };

        if let Some(victim) = self.victim {
            cache.shared.scavenger.set_victim(Arc::new(VictimTransfer {
                victim: victim.clone(),
            }));
            *cache.shared.victim.write() = Some(victim);
        }
        // Seed the admission queue's size cap; the throughput task keeps it
        // current from then on.
        cache.shared.refresh_admission_capacity();
        if self.background {
            cache.start_background();
        }
        Ok(cache)
    }
}

impl Cache {
    /// Build a cache with default wiring.
    pub fn new(cfg: CacheConfig) -> CacheResult<Self> {
        CacheBuilder::new(cfg).build()
    }

    /// Shorthand for [`CacheBuilder::new`].
    pub fn builder(cfg: CacheConfig) -> CacheBuilder {
        CacheBuilder::new(cfg)
    }

    /// Build the full cache topology declared in a parsed configuration
    /// file, returning the outermost tier.
    pub fn from_config(file: &ConfigFile) -> CacheResult<Self> {
        let topology = file.topology()?;
        let (root, _) = topology
            .first()
            .ok_or_else(|| CacheError::Config("no caches declared".to_string()))?;
        Self::build_chain(file, root, 0)
    }

    fn build_chain(file: &ConfigFile, name: &str, depth: usize) -> CacheResult<Self> {
        if depth > 8 {
            return Err(CacheError::Config("victim cache chain too deep".to_string()));
        }
        let cfg = file.resolve(name)?;
        let victim = match &cfg.victim_name {
            Some(victim_name) => Some(Self::build_chain(file, victim_name, depth + 1)?),
            None => None,
        };
        let mut builder = CacheBuilder::new(cfg);
        if let Some(victim) = victim {
            builder = builder.victim(victim);
        }
        builder.build()
    }

    fn start_background(&self) {
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.cfg.scavenger_run_interval;
        let signal = self.shared.scav_signal.clone();
        let name = self.shared.cfg.cache_name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-scavenger"))
            .spawn(move || scavenger_loop(weak, signal, interval))
            .expect("failed to spawn scavenger thread");
        *self.shared.scav_thread.lock() = Some(handle);

        let mut scheduler = Scheduler::new(self.shared.clock.clone());
        let signal = self.shared.scav_signal.clone();
        scheduler.schedule(self.shared.cfg.scavenger_run_interval, move || {
            signal.notify();
        });
        let weak = Arc::downgrade(&self.shared);
        scheduler.schedule(self.shared.cfg.throughput_check_interval, move || {
            if let Some(shared) = weak.upgrade() {
                shared.refresh_admission_capacity();
                shared.throughput.adjust();
            }
        });
        scheduler.start(&self.shared.cfg.cache_name);
        *self.shared.scheduler.lock() = Some(scheduler);
    }

    /// Store a key/value pair with the default insertion rank.
    /// `expire` is an absolute epoch-millisecond deadline; 0 never expires.
    pub fn put(&self, key: &[u8], value: &[u8], expire: u64) -> CacheResult<()> {
        let rank = self.shared.cfg.slru_insert_point;
        self.put_with_rank(key, value, expire, rank, false)
    }

    /// Store a key/value pair with an explicit popularity rank.
    /// `force` bypasses the admission policy.
    pub fn put_with_rank(
        &self,
        key: &[u8],
        value: &[u8],
        expire: u64,
        rank: usize,
        force: bool,
    ) -> CacheResult<()> {
        let shared = &self.shared;
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        if rank >= shared.cfg.num_popularity_ranks {
            return Err(CacheError::InvalidRank);
        }
        if shared.usage() >= shared.cfg.write_rejection_threshold {
            shared.scav_signal.notify();
            shared.counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::WriteRejected);
        }
        if !shared.stall.wait_if_stalled(shared.cfg.writes_max_wait_time) {
            shared.counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::WriteRejected);
        }
        if !force {
            if let Some(admission) = &shared.admission {
                if !admission.admit(key) {
                    return Ok(());
                }
            }
        }
        let (rank, expire) = match &shared.admission {
            Some(admission) => (
                admission.adjust_rank(rank, expire),
                admission.adjust_expiration(expire),
            ),
            None => (rank, expire),
        };
        shared.counters.writes.fetch_add(1, Ordering::Relaxed);
        match shared.engine.put(key, value, expire, rank) {
            Ok(()) => {
                shared
                    .throughput
                    .record((key.len() + value.len()) as u64);
                if shared.scavenger.should_run() {
                    shared.scav_signal.notify();
                }
                Ok(())
            }
            Err(CacheError::InvalidKey) => Err(CacheError::InvalidKey),
            Err(e) => {
                tracing::debug!(error = %e, "write rejected by engine");
                shared.counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
                shared.scav_signal.notify();
                Err(CacheError::WriteRejected)
            }
        }
    }

    /// Look up a key. On a hit the value is copied into `buf` and its
    /// length returned; a length greater than `buf.len()` means the value
    /// did not fit and the caller should retry with a larger buffer.
    /// Misses fall through to the victim cache when one is attached.
    pub fn get(&self, key: &[u8], buf: &mut [u8]) -> Option<usize> {
        let shared = &self.shared;
        match shared.engine.get(key, buf) {
            Some(len) if len <= buf.len() => {
                shared.counters.gets.fetch_add(1, Ordering::Relaxed);
                shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(admission) = &shared.admission {
                    admission.access(key);
                }
                Some(len)
            }
            // Buffer too small: report the required size without touching
            // the counters; the caller retries.
            Some(len) => Some(len),
            None => {
                shared.counters.gets.fetch_add(1, Ordering::Relaxed);
                let victim = shared.victim.read().clone();
                let victim = victim?;
                let len = victim.get(key, buf)?;
                if len <= buf.len() && shared.cfg.victim_promotion_on_hit {
                    self.promote_from_victim(&victim, key, &buf[..len]);
                }
                Some(len)
            }
        }
    }

    /// Write a victim-tier hit back into the main tier, preserving the
    /// victim's stored expiration, then drop the victim copy.
    fn promote_from_victim(&self, victim: &Cache, key: &[u8], value: &[u8]) {
        let expire = victim.shared.engine.get_expire(key).unwrap_or(0);
        let rank = self.shared.cfg.slru_insert_point;
        if self.put_with_rank(key, value, expire, rank, true).is_ok() {
            victim.delete(key);
        }
    }

    /// Delete a key from the main tier, falling through to the victim when
    /// the main tier does not hold it.
    pub fn delete(&self, key: &[u8]) -> bool {
        if self.shared.engine.delete(key) {
            return true;
        }
        let victim = self.shared.victim.read().clone();
        match victim {
            Some(victim) => victim.delete(key),
            None => false,
        }
    }

    /// Expire a key immediately. Alias of [`Cache::delete`].
    pub fn expire(&self, key: &[u8]) -> bool {
        self.delete(key)
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        CacheStats {
            gets: shared.counters.gets.load(Ordering::Relaxed),
            hits: shared.counters.hits.load(Ordering::Relaxed),
            writes: shared.counters.writes.load(Ordering::Relaxed),
            rejected_writes: shared.counters.rejected_writes.load(Ordering::Relaxed),
            items: shared.engine.index().len(),
            used_bytes: shared.engine.pool().used_bytes(),
            allocated_bytes: shared.engine.pool().allocated_bytes(),
            expired_evicted_balance: shared.engine.index().expired_evicted_balance(),
        }
    }

    /// Fraction of the configured maximum currently allocated.
    pub fn usage(&self) -> f64 {
        self.shared.usage()
    }

    /// The attached victim cache, if any.
    pub fn victim(&self) -> Option<Cache> {
        self.shared.victim.read().clone()
    }

    /// Scavenger statistics.
    pub fn scavenger_stats(&self) -> &Arc<ScavengerStats> {
        &self.shared.scav_stats
    }

    /// Run one synchronous scavenger pass. Returns segments recycled.
    /// Tests use this with background threads disabled.
    pub fn run_scavenger_once(&self) -> usize {
        self.shared.scavenger.run_once()
    }

    /// Run one synchronous throughput adjustment.
    pub fn run_throughput_check_once(&self) -> bool {
        self.shared.refresh_admission_capacity();
        self.shared.throughput.adjust()
    }

    /// Stop background threads. Called automatically when the last handle
    /// drops; explicit calls make shutdown prompt.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.shutdown.store(true, Ordering::Release);
        shared.scav_signal.notify();
        if let Some(mut scheduler) = shared.scheduler.lock().take() {
            scheduler.stop();
        }
        if let Some(handle) = shared.scav_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(victim) = shared.victim.read().clone() {
            victim.close();
        }
    }

    // ---- persistence ----

    fn snapshot_dir(&self) -> PathBuf {
        self.shared
            .cfg
            .snapshot_dir
            .join(&self.shared.cfg.cache_name)
    }

    /// Persist the cache: counters, engine (segments + index), throughput,
    /// admission, and scavenger state, one file each under the snapshot
    /// directory. The victim tier saves itself recursively.
    pub fn save(&self) -> CacheResult<()> {
        let dir = self.snapshot_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            CacheError::Config(format!("cannot create snapshot directory: {}", e))
        })?;
        let shared = &self.shared;

        let mut w = File::create(dir.join(CACHE_SNAPSHOT_NAME))?;
        put_u32(&mut w, CACHE_SNAPSHOT_MAGIC)?;
        put_u64(&mut w, shared.counters.gets.load(Ordering::Relaxed))?;
        put_u64(&mut w, shared.counters.hits.load(Ordering::Relaxed))?;
        put_u64(&mut w, shared.counters.writes.load(Ordering::Relaxed))?;
        put_u64(&mut w, shared.counters.rejected_writes.load(Ordering::Relaxed))?;
        put_u64(&mut w, shared.epoch.load(Ordering::Relaxed))?;
        w.sync_all().map_err(CacheError::Io)?;

        let mut w = File::create(dir.join(ENGINE_SNAPSHOT_NAME))?;
        shared.engine.save(&mut w)?;
        w.sync_all().map_err(CacheError::Io)?;

        let mut w = File::create(dir.join(THROUGHPUT_SNAPSHOT_NAME))?;
        shared.throughput.save(&mut w)?;

        let mut w = File::create(dir.join(SCAVENGER_SNAPSHOT_NAME))?;
        shared.scav_stats.save(&mut w)?;
        crate::util::put_f64(&mut w, shared.dump_ratio.current())?;

        // Built-in recycling selectors are stateless; the file marks which
        // snapshot generation wrote them.
        let mut w = File::create(dir.join(RECYCLING_SNAPSHOT_NAME))?;
        put_u32(&mut w, CACHE_SNAPSHOT_MAGIC)?;

        if let Some(admission) = &shared.admission {
            let mut w = File::create(dir.join(ADMISSION_SNAPSHOT_NAME))?;
            admission.save(&mut w)?;
        }

        if let Some(victim) = shared.victim.read().clone() {
            victim.save()?;
        }
        tracing::info!(cache = %shared.cfg.cache_name, "snapshot saved");
        Ok(())
    }

    /// Restore a snapshot previously written by [`Cache::save`].
    pub fn load(&self) -> CacheResult<()> {
        let dir = self.snapshot_dir();
        let shared = &self.shared;

        let mut r = File::open(dir.join(CACHE_SNAPSHOT_NAME))?;
        if get_u32(&mut r)? != CACHE_SNAPSHOT_MAGIC {
            return Err(CacheError::Corrupted);
        }
        shared
            .counters
            .gets
            .store(get_u64(&mut r)?, Ordering::Relaxed);
        shared
            .counters
            .hits
            .store(get_u64(&mut r)?, Ordering::Relaxed);
        shared
            .counters
            .writes
            .store(get_u64(&mut r)?, Ordering::Relaxed);
        shared
            .counters
            .rejected_writes
            .store(get_u64(&mut r)?, Ordering::Relaxed);
        shared.epoch.store(get_u64(&mut r)?, Ordering::Relaxed);

        let mut r = File::open(dir.join(ENGINE_SNAPSHOT_NAME))?;
        shared.engine.load(&mut r)?;

        let mut r = File::open(dir.join(THROUGHPUT_SNAPSHOT_NAME))?;
        shared.throughput.load(&mut r)?;

        let mut r = File::open(dir.join(SCAVENGER_SNAPSHOT_NAME))?;
        shared.scav_stats.load(&mut r)?;
        shared.dump_ratio.set(crate::util::get_f64(&mut r)?);

        if let Some(admission) = &shared.admission {
            match File::open(dir.join(ADMISSION_SNAPSHOT_NAME)) {
                Ok(mut r) => admission.load(&mut r)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }

        if let Some(victim) = shared.victim.read().clone() {
            victim.load()?;
        }
        tracing::info!(cache = %shared.cfg.cache_name, "snapshot loaded");
        Ok(())
    }
}

impl CacheShared {
    fn usage(&self) -> f64 {
        if self.cfg.max_size == 0 {
            return 0.0;
        }
        self.engine.pool().allocated_bytes() as f64 / self.cfg.max_size as f64
    }

    fn refresh_admission_capacity(&self) {
        let Some(admission) = &self.admission else {
            return;
        };
        if self.cfg.max_size == 0 {
            return;
        }
        let entries = self.cfg.max_size / self.engine.pool().mean_item_size();
        admission.update_capacity_hint(entries);
    }
}

fn scavenger_loop(
    weak: Weak<CacheShared>,
    signal: Arc<ScavengerSignal>,
    interval: std::time::Duration,
) {
    loop {
        signal.wait(interval);
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if shared.scavenger.should_run() || shared.stall.is_stalled() {
            shared.scavenger.run_once();
        }
    }
}
