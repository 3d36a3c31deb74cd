//! Sustained write-rate control.
//!
//! [`ThroughputController`] accounts every byte admitted to the cache and,
//! at each check interval, compares the sustained rate against the
//! configured goal. Outside the tolerance band it nudges two dials one
//! step: the admission policy's scale and the scavenger's dump-below
//! threshold. It never blocks writes itself; rejection stays with the
//! facade's write-rejection threshold.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::admission::AdmissionPolicy;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::scavenger::DumpRatio;
use crate::util::{get_f64, get_u64, put_f64, put_u64};

/// Advisory controller bounding sustained ingress bytes/second.
pub struct ThroughputController {
    goal_bps: u64,
    tolerance: f64,
    steps: usize,
    start_time: AtomicU64,
    total_bytes: AtomicU64,
    /// Admission dial position in `[0, 1]`, stored as f64 bits.
    scale: AtomicU64,
    admission: Option<Arc<dyn AdmissionPolicy>>,
    dump_ratio: Arc<DumpRatio>,
    clock: Arc<dyn Clock>,
}

impl ThroughputController {
    pub fn new(
        cfg: &CacheConfig,
        admission: Option<Arc<dyn AdmissionPolicy>>,
        dump_ratio: Arc<DumpRatio>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            goal_bps: cfg.write_rate_limit,
            tolerance: cfg.throughput_tolerance,
            steps: cfg.throughput_adjustment_steps.max(1),
            start_time: AtomicU64::new(clock.now_millis()),
            total_bytes: AtomicU64::new(0),
            scale: AtomicU64::new(1.0f64.to_bits()),
            admission,
            dump_ratio,
            clock,
        }
    }

    /// Record bytes admitted to the cache.
    pub fn record(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes recorded since the controller started.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Sustained rate since start, in bytes/second.
    pub fn current_rate(&self) -> u64 {
        let now = self.clock.now_millis();
        let start = self.start_time.load(Ordering::Relaxed);
        let elapsed_ms = now.saturating_sub(start).max(1);
        self.total_bytes.load(Ordering::Relaxed) * 1000 / elapsed_ms
    }

    fn scale_value(&self) -> f64 {
        f64::from_bits(self.scale.load(Ordering::Relaxed))
    }

    /// Compare the sustained rate to the goal and step the dials when it
    /// falls outside the tolerance band. Returns whether an adjustment was
    /// made.
    pub fn adjust(&self) -> bool {
        let rate = self.current_rate();
        let goal = self.goal_bps as f64;
        let deviation = rate as f64 - goal;
        if deviation.abs() <= self.tolerance * goal {
            return false;
        }
        let step = 1.0 / self.steps as f64;
        let scale = self.scale_value();
        let new_scale = if deviation > 0.0 {
            // Over goal: admit less, dump more.
            self.dump_ratio.raise_step();
            (scale - step).max(0.0)
        } else {
            self.dump_ratio.lower_step();
            (scale + step).min(1.0)
        };
        self.scale.store(new_scale.to_bits(), Ordering::Relaxed);
        if let Some(admission) = &self.admission {
            admission.set_scale(new_scale);
        }
        tracing::info!(
            rate,
            goal = self.goal_bps,
            scale = new_scale,
            dump_ratio = self.dump_ratio.current(),
            "throughput adjusted"
        );
        true
    }

    /// Persist accounting state.
    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u64(w, self.start_time.load(Ordering::Relaxed))?;
        put_u64(w, self.total_bytes.load(Ordering::Relaxed))?;
        put_f64(w, self.scale_value())
    }

    /// Restore accounting state.
    pub fn load<R: Read>(&self, r: &mut R) -> io::Result<()> {
        self.start_time.store(get_u64(r)?, Ordering::Relaxed);
        self.total_bytes.store(get_u64(r)?, Ordering::Relaxed);
        self.scale.store(get_f64(r)?.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}
