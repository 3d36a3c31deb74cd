//! The scavenger: background segment reclamation.
//!
//! A run picks a victim segment through the [`RecyclingSelector`], walks
//! its items, and asks the memory index what each one is worth:
//!
//! | Index verdict | Action |
//! |---|---|
//! | `NotFound`   | skip; already deleted or superseded elsewhere |
//! | `Expired`    | account the expiration, drop |
//! | `Deleted`    | below the dump threshold: transfer to the victim tier, drop |
//! | `Ok`         | rewrite into the active segment, relocate the index entry |
//!
//! then releases the segment. Runs continue until usage falls to the stop
//! ratio. A run that chews through `max_segments_before_stall` segments
//! without getting there raises the write stall, parking writers for up to
//! their configured wait.
//!
//! The dump-below threshold starts low and is raised stepwise while the
//! active-dataset ratio stays under its minimum, trading rewrite traffic
//! for reclaimed space.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::admission::AdmissionPolicy;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::index::ScavengerVerdict;
use crate::recycling::RecyclingSelector;
use crate::storage::segment::encoded_item_size;
use crate::storage::StorageEngine;
use crate::util::{get_u64, put_u64};

/// Receives items the scavenger evicts from the main tier.
pub trait VictimSink: Send + Sync {
    fn transfer(&self, key: &[u8], value: &[u8], expire: u64);
}

/// The dump-below popularity threshold, shared between the scavenger and
/// the throughput controller.
pub struct DumpRatio {
    bits: AtomicU64,
    start: f64,
    stop: f64,
    step: f64,
}

impl DumpRatio {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
            start,
            stop,
            step,
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(
            cfg.scavenger_dump_entry_below_start,
            cfg.scavenger_dump_entry_below_stop,
            cfg.scavenger_dump_entry_below_step,
        )
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// One step toward the stop bound.
    pub fn raise_step(&self) {
        let next = (self.current() + self.step).min(self.stop);
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }

    /// One step back toward the start bound.
    pub fn lower_step(&self) {
        let next = (self.current() - self.step).max(self.start);
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn set(&self, value: f64) {
        self.bits
            .store(value.clamp(self.start, self.stop).to_bits(), Ordering::Relaxed);
    }
}

/// Write-stall gate. The scavenger raises it when it cannot keep up;
/// writers park on it for a bounded wait before being rejected.
#[derive(Default)]
pub struct StallControl {
    stalled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StallControl {
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn enter(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    pub fn exit(&self) {
        self.stalled.store(false, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Park for at most `timeout` while stalled. True when the caller may
    /// proceed.
    pub fn wait_if_stalled(&self, timeout: Duration) -> bool {
        if !self.is_stalled() {
            return true;
        }
        let mut guard = self.lock.lock();
        if !self.is_stalled() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        !self.is_stalled()
    }
}

/// Wakeup channel for the scavenger thread: periodic timeout or an
/// on-demand nudge when usage crosses the start ratio.
#[derive(Default)]
pub struct ScavengerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl ScavengerSignal {
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Wait for a nudge or the timeout. True when nudged.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

/// Counters across all scavenger runs.
#[derive(Default)]
pub struct ScavengerStats {
    pub runs: AtomicU64,
    pub segments_scanned: AtomicU64,
    pub items_scanned: AtomicU64,
    pub items_expired: AtomicU64,
    pub items_freed: AtomicU64,
    pub items_rewritten: AtomicU64,
    pub items_transferred: AtomicU64,
    pub bytes_reclaimed: AtomicU64,
}

impl ScavengerStats {
    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for counter in [
            &self.runs,
            &self.segments_scanned,
            &self.items_scanned,
            &self.items_expired,
            &self.items_freed,
            &self.items_rewritten,
            &self.items_transferred,
            &self.bytes_reclaimed,
        ] {
            put_u64(w, counter.load(Ordering::Relaxed))?;
        }
        Ok(())
    }

    pub fn load<R: Read>(&self, r: &mut R) -> io::Result<()> {
        for counter in [
            &self.runs,
            &self.segments_scanned,
            &self.items_scanned,
            &self.items_expired,
            &self.items_freed,
            &self.items_rewritten,
            &self.items_transferred,
            &self.bytes_reclaimed,
        ] {
            counter.store(get_u64(r)?, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// One cache's scavenger: selection, scanning, and the decision loop.
pub struct Scavenger {
    engine: Arc<StorageEngine>,
    selector: Box<dyn RecyclingSelector>,
    dump_ratio: Arc<DumpRatio>,
    stats: Arc<ScavengerStats>,
    stall: Arc<StallControl>,
    victim: Mutex<Option<Arc<dyn VictimSink>>>,
    admission: Option<Arc<dyn AdmissionPolicy>>,
    clock: Arc<dyn Clock>,
    max_size: u64,
    start_ratio: f64,
    stop_ratio: f64,
    max_segments_before_stall: usize,
    min_active_dataset_ratio: f64,
    readmission_hit_count_min: u8,
    sparse_files: bool,
}

impl Scavenger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &CacheConfig,
        engine: Arc<StorageEngine>,
        selector: Box<dyn RecyclingSelector>,
        dump_ratio: Arc<DumpRatio>,
        stats: Arc<ScavengerStats>,
        stall: Arc<StallControl>,
        admission: Option<Arc<dyn AdmissionPolicy>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            selector,
            dump_ratio,
            stats,
            stall,
            victim: Mutex::new(None),
            admission,
            clock,
            max_size: cfg.max_size,
            start_ratio: cfg.scavenger_start_ratio,
            stop_ratio: cfg.scavenger_stop_ratio,
            max_segments_before_stall: cfg.scavenger_max_segments_before_stall,
            min_active_dataset_ratio: cfg.minimum_active_dataset_ratio,
            readmission_hit_count_min: cfg.readmission_hit_count_min,
            sparse_files: cfg.sparse_files_support,
        }
    }

    /// Install the victim-tier sink (set once at cache wiring time).
    pub fn set_victim(&self, sink: Arc<dyn VictimSink>) {
        *self.victim.lock() = Some(sink);
    }

    /// Fraction of the configured maximum currently used. Accounting is
    /// segment-granular (allocated segments), matching how space is
    /// actually reserved and reclaimed. 0 for unlimited caches, which are
    /// never scavenged by pressure.
    pub fn usage(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.engine.pool().allocated_bytes() as f64 / self.max_size as f64
    }

    /// Whether usage has crossed the start ratio.
    pub fn should_run(&self) -> bool {
        self.usage() >= self.start_ratio
    }

    /// One full scavenger run. Returns the number of segments recycled.
    ///
    /// The run ends when usage falls to the stop ratio, no sealed segment
    /// remains, or the pass budget is spent. A run that exhausts the stall
    /// limit without reaching the stop ratio leaves the write stall raised;
    /// it lifts only once a later pass gets usage back under the ratio.
    pub fn run_once(&self) -> usize {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        // Budget bounds a run on an all-hot cache, where rewrites give back
        // roughly what each release frees.
        let budget = self
            .max_segments_before_stall
            .max(2 * self.engine.pool().segment_count());
        let mut recycled = 0usize;
        while self.usage() > self.stop_ratio {
            let now = self.clock.now_millis();
            let candidates = self.engine.pool().sealed_infos();
            let Some(sid) = self.selector.select(&candidates, now) else {
                break;
            };
            let freed = self
                .engine
                .pool()
                .get(sid)
                .map(|seg| u64::from(seg.info().used_bytes))
                .unwrap_or(0);
            if let Err(e) = self.scavenge_segment(sid) {
                tracing::warn!(sid, error = %e, "segment scan aborted");
            }
            self.stats.segments_scanned.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_reclaimed.fetch_add(freed, Ordering::Relaxed);
            recycled += 1;

            if recycled >= self.max_segments_before_stall && self.usage() > self.stop_ratio {
                if !self.stall.is_stalled() {
                    tracing::warn!(
                        recycled,
                        usage = self.usage(),
                        "scavenger behind; stalling writes"
                    );
                }
                self.stall.enter();
            }
            if recycled >= budget {
                break;
            }
        }
        if self.usage() <= self.stop_ratio {
            self.stall.exit();
        }
        self.adjust_dump_ratio();
        recycled
    }

    /// Scan one victim segment and apply the per-item decision table.
    /// Always releases the segment, even on scan errors.
    ///
    /// The RAM scanner snapshots the segment's buffer and the file scanner
    /// keeps its descriptor across the unlink, so the segment is normally
    /// released *before* the items are processed; rewrites then have the
    /// reclaimed space available. Sparse file segments are the exception:
    /// they stay in place while dead ranges are punched out during the
    /// scan, releasing space incrementally, and go only at the end.
    fn scavenge_segment(&self, sid: u16) -> Result<(), CacheError> {
        let punchable = self.sparse_files
            && self
                .engine
                .pool()
                .get(sid)
                .map(|seg| !seg.is_ram_resident())
                .unwrap_or(false);
        let mut scanner = match self.engine.scanner(sid) {
            Ok(scanner) => scanner,
            Err(e) => {
                self.engine.release_segment(sid);
                return Err(e);
            }
        };
        if !punchable {
            self.engine.release_segment(sid);
        }
        let result = self.process_items(&mut scanner, sid, punchable);
        if punchable {
            self.engine.release_segment(sid);
        }
        result
    }

    fn process_items(
        &self,
        scanner: &mut crate::storage::SegmentScanner,
        sid: u16,
        punchable: bool,
    ) -> Result<(), CacheError> {
        let dump_below = self.dump_ratio.current();
        while let Some(item) = scanner.next_item()? {
            self.stats.items_scanned.fetch_add(1, Ordering::Relaxed);
            let item_len = encoded_item_size(item.key.len(), item.value.len());
            let verdict = self
                .engine
                .index()
                .check_delete_for_scavenger(&item.key, sid, item.offset, dump_below);
            match verdict {
                ScavengerVerdict::NotFound => {
                    if punchable {
                        self.engine.punch_dead_range(sid, item.offset, item_len);
                    }
                }
                ScavengerVerdict::Expired { .. } => {
                    self.stats.items_expired.fetch_add(1, Ordering::Relaxed);
                    if punchable {
                        self.engine.punch_dead_range(sid, item.offset, item_len);
                    }
                }
                ScavengerVerdict::Deleted { hit_count, .. } => {
                    self.stats.items_freed.fetch_add(1, Ordering::Relaxed);
                    // An item that saw use gets its hash re-seeded so the
                    // next sighting readmits it straight away.
                    if hit_count >= self.readmission_hit_count_min {
                        if let Some(admission) = &self.admission {
                            admission.readmit(&item.key);
                        }
                    }
                    let victim = self.victim.lock().clone();
                    if let Some(sink) = victim {
                        sink.transfer(&item.key, &item.value, item.expire);
                        self.stats.items_transferred.fetch_add(1, Ordering::Relaxed);
                    }
                    if punchable {
                        self.engine.punch_dead_range(sid, item.offset, item_len);
                    }
                }
                ScavengerVerdict::Ok { rank, .. } => {
                    match self.engine.rewrite(&item.key, &item.value, item.expire, rank) {
                        Ok((new_sid, new_offset)) => {
                            if self.engine.index().update_location(&item.key, new_sid, new_offset)
                            {
                                self.stats.items_rewritten.fetch_add(1, Ordering::Relaxed);
                            } else if let Some(seg) = self.engine.pool().get(new_sid) {
                                // Entry vanished between probe and relocate.
                                seg.item_removed();
                            }
                        }
                        Err(e) => {
                            // No room to rewrite: drop the entry rather than
                            // leave it dangling at a recycled segment.
                            tracing::warn!(error = %e, "rewrite failed; dropping item");
                            self.engine.index().delete(&item.key);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn adjust_dump_ratio(&self) {
        let total = self.engine.pool().total_items();
        if total == 0 {
            return;
        }
        let active = self.engine.pool().total_active_items();
        let active_ratio = active as f64 / total as f64;
        if active_ratio < self.min_active_dataset_ratio {
            self.dump_ratio.raise_step();
            tracing::debug!(
                active_ratio,
                dump_ratio = self.dump_ratio.current(),
                "dump threshold raised"
            );
        }
    }
}
