//! Cache configuration.
//!
//! [`CacheConfig`] is the fully resolved configuration of one cache
//! instance, threaded explicitly through constructors (no global state).
//! [`ConfigFile`] is the TOML representation: a `[defaults]` table plus one
//! `[cache.<name>]` override table per cache, keyed by the dotted option
//! names of the shipped `.conf` template.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Default segment size for off-heap (RAM) caches: 4 MiB.
pub const DEFAULT_SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Default segment size for file-backed caches: 256 MiB.
pub const DEFAULT_DISK_SEGMENT_SIZE: usize = 256 * 1024 * 1024;

/// Storage backend of a cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// RAM-resident segments.
    Offheap,
    /// File-backed segments, one file per sealed segment.
    File,
}

/// Resolved configuration for a single cache instance.
///
/// Field defaults mirror the shipped `.conf` template; see the builder
/// methods for the handful of knobs tests typically override.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name; used for snapshot/data subdirectories and log context.
    pub cache_name: String,
    /// Storage backend.
    pub kind: CacheKind,
    /// Directory for snapshot files.
    pub snapshot_dir: PathBuf,
    /// Directory for segment data files (file backend only).
    pub data_dir: PathBuf,
    /// Segment size in bytes.
    pub segment_size: usize,
    /// Maximum storage size in bytes. 0 means unlimited.
    pub max_size: u64,

    /// Usage ratio at which the scavenger starts running.
    pub scavenger_start_ratio: f64,
    /// Usage ratio at which the scavenger stops.
    pub scavenger_stop_ratio: f64,
    /// Initial dump-below popularity threshold.
    pub scavenger_dump_entry_below_start: f64,
    /// Upper bound for the dump-below threshold.
    pub scavenger_dump_entry_below_stop: f64,
    /// Step by which the dump-below threshold is raised under pressure.
    pub scavenger_dump_entry_below_step: f64,
    /// Interval between periodic scavenger runs.
    pub scavenger_run_interval: Duration,
    /// Segments the scavenger processes in one run before declaring a
    /// write stall.
    pub scavenger_max_segments_before_stall: usize,

    /// Number of popularity ranks; ranks are `0..num_ranks`, 0 hottest.
    pub num_popularity_ranks: usize,
    /// Number of virtual SLRU segments per index block.
    pub slru_num_segments: usize,
    /// Default insertion rank for new items.
    pub slru_insert_point: usize,

    /// Admission queue size at startup, as a ratio of estimated capacity.
    pub admission_queue_start_size_ratio: f64,
    /// Lower bound for the admission queue size ratio.
    pub admission_queue_min_size_ratio: f64,
    /// Upper bound for the admission queue size ratio.
    pub admission_queue_max_size_ratio: f64,
    /// Minimum hit count for an item evicted by the scavenger to have its
    /// hash re-seeded into the admission queue, so the next sighting
    /// readmits it without a second miss.
    pub readmission_hit_count_min: u8,

    /// Sustained write rate goal in bytes per second.
    pub write_rate_limit: u64,
    /// Interval between throughput controller checks.
    pub throughput_check_interval: Duration,
    /// Tolerated relative deviation from the rate goal.
    pub throughput_tolerance: f64,
    /// Number of steps each throughput dial is divided into.
    pub throughput_adjustment_steps: usize,
    /// Maximum time a write parks while the cache is stalled.
    pub writes_max_wait_time: Duration,
    /// Usage ratio at which writes are rejected outright. Usage is
    /// segment-granular, so the default only rejects when every segment is
    /// allocated; backpressure below that comes from the write stall.
    pub write_rejection_threshold: f64,

    /// log2 of the initial number of index slots.
    pub index_slots_power: u32,
    /// Store small items inline in index entries.
    pub index_data_embedded: bool,
    /// Maximum serialized k/v size for embedding.
    pub index_data_embedded_size: usize,

    /// First expiration bin edge in seconds for rank adjustment.
    pub expire_start_bin_value: u64,
    /// Multiplier between successive expiration bins.
    pub expire_multiplier_value: f64,

    /// Punch holes in segment files instead of leaving dead ranges.
    pub sparse_files_support: bool,
    /// Active-dataset ratio below which the dump threshold is raised.
    pub minimum_active_dataset_ratio: f64,
    /// Size of the reusable I/O scratch buffer pool.
    pub storage_pool_size: usize,
    /// Re-insert items into the main tier on victim-cache hits.
    pub victim_promotion_on_hit: bool,
    /// Disable in-block eviction entirely (testing aid).
    pub eviction_disabled_mode: bool,
    /// Read-ahead window for sequential file segment scans.
    pub file_prefetch_buffer_size: usize,
    /// Block size for the block-aligned data writer. 0 selects the base
    /// (unaligned) writer.
    pub block_writer_block_size: usize,
    /// Starting admission probability for the random admission policy.
    pub random_admission_ratio_start: f64,
    /// Final admission probability for the random admission policy.
    pub random_admission_ratio_stop: f64,

    /// Name of the victim cache, if any (topology wiring only).
    pub victim_name: Option<String>,
}

impl CacheConfig {
    /// Configuration for an off-heap cache with default settings.
    pub fn offheap(name: impl Into<String>) -> Self {
        Self {
            cache_name: name.into(),
            kind: CacheKind::Offheap,
            snapshot_dir: PathBuf::from("snapshot"),
            data_dir: PathBuf::from("data"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_size: 0,
            scavenger_start_ratio: 0.95,
            scavenger_stop_ratio: 0.90,
            scavenger_dump_entry_below_start: 0.1,
            scavenger_dump_entry_below_stop: 0.5,
            scavenger_dump_entry_below_step: 0.1,
            scavenger_run_interval: Duration::from_secs(60),
            scavenger_max_segments_before_stall: 10,
            num_popularity_ranks: 8,
            slru_num_segments: 8,
            slru_insert_point: 4,
            admission_queue_start_size_ratio: 0.5,
            admission_queue_min_size_ratio: 0.1,
            admission_queue_max_size_ratio: 0.5,
            readmission_hit_count_min: 1,
            write_rate_limit: 50 * 1024 * 1024,
            throughput_check_interval: Duration::from_secs(3600),
            throughput_tolerance: 0.05,
            throughput_adjustment_steps: 10,
            writes_max_wait_time: Duration::from_millis(10),
            write_rejection_threshold: 1.0,
            index_slots_power: 10,
            index_data_embedded: false,
            index_data_embedded_size: 100,
            expire_start_bin_value: 60,
            expire_multiplier_value: 2.0,
            sparse_files_support: false,
            minimum_active_dataset_ratio: 0.9,
            storage_pool_size: 32,
            victim_promotion_on_hit: true,
            eviction_disabled_mode: false,
            file_prefetch_buffer_size: 4 * 1024 * 1024,
            block_writer_block_size: 0,
            random_admission_ratio_start: 1.0,
            random_admission_ratio_stop: 0.0,
            victim_name: None,
        }
    }

    /// Configuration for a file-backed cache with default settings.
    pub fn file(name: impl Into<String>) -> Self {
        let mut cfg = Self::offheap(name);
        cfg.kind = CacheKind::File;
        cfg.segment_size = DEFAULT_DISK_SEGMENT_SIZE;
        cfg.block_writer_block_size = 4096;
        cfg
    }

    /// Set the maximum storage size in bytes.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Set the segment size in bytes.
    pub fn with_segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Set the initial index table size to `2^power` slots.
    pub fn with_index_slots_power(mut self, power: u32) -> Self {
        self.index_slots_power = power;
        self
    }

    /// Set the snapshot directory.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    /// Set the data directory (file backend).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the scavenger start/stop usage ratios.
    pub fn with_scavenger_ratios(mut self, start: f64, stop: f64) -> Self {
        self.scavenger_start_ratio = start;
        self.scavenger_stop_ratio = stop;
        self
    }

    /// Set the scavenger run interval.
    pub fn with_scavenger_run_interval(mut self, interval: Duration) -> Self {
        self.scavenger_run_interval = interval;
        self
    }

    /// Set the usage ratio at which writes are rejected.
    pub fn with_write_rejection_threshold(mut self, ratio: f64) -> Self {
        self.write_rejection_threshold = ratio;
        self
    }

    /// Enable inline storage of items up to `max_bytes` in index entries.
    pub fn with_embedded_data(mut self, max_bytes: usize) -> Self {
        self.index_data_embedded = true;
        self.index_data_embedded_size = max_bytes;
        self
    }

    /// Set the victim cache name.
    pub fn with_victim(mut self, name: impl Into<String>) -> Self {
        self.victim_name = Some(name.into());
        self
    }

    /// Validate invariants that would otherwise surface as bugs at runtime.
    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_name.is_empty() {
            return Err(CacheError::Config("cache name is empty".to_string()));
        }
        if self.segment_size < 1024 {
            return Err(CacheError::Config(format!(
                "segment size {} too small",
                self.segment_size
            )));
        }
        if self.max_size != 0 && self.max_size < self.segment_size as u64 {
            return Err(CacheError::Config(
                "max size smaller than one segment".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scavenger_stop_ratio)
            || !(0.0..=1.0).contains(&self.scavenger_start_ratio)
            || self.scavenger_stop_ratio > self.scavenger_start_ratio
        {
            return Err(CacheError::Config(
                "scavenger ratios must satisfy 0 <= stop <= start <= 1".to_string(),
            ));
        }
        if self.scavenger_dump_entry_below_start > self.scavenger_dump_entry_below_stop
            || self.scavenger_dump_entry_below_start < 0.0
            || self.scavenger_dump_entry_below_stop > 1.0
        {
            return Err(CacheError::Config(
                "dump-below thresholds must satisfy 0 <= start <= stop <= 1".to_string(),
            ));
        }
        if self.num_popularity_ranks == 0 || self.num_popularity_ranks > 64 {
            return Err(CacheError::Config(
                "popularity ranks must be in 1..=64".to_string(),
            ));
        }
        if self.slru_insert_point >= self.num_popularity_ranks {
            return Err(CacheError::Config(
                "slru insert point must be a valid rank".to_string(),
            ));
        }
        if self.slru_num_segments == 0 {
            return Err(CacheError::Config(
                "slru segment count must be positive".to_string(),
            ));
        }
        if self.index_slots_power < 1 || self.index_slots_power > 32 {
            return Err(CacheError::Config(
                "index slots power must be in 1..=32".to_string(),
            ));
        }
        if self.kind == CacheKind::Offheap && self.victim_name.is_some() {
            // allowed: RAM cache may have a victim
        } else if self.kind == CacheKind::File && self.victim_name.is_some() {
            return Err(CacheError::Config(
                "a file cache may not have a victim cache".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-cache override table; every field optional, keyed by the dotted
/// option names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheOptions {
    #[serde(rename = "victim.name")]
    pub victim_name: Option<String>,
    #[serde(rename = "snapshot.dir.name")]
    pub snapshot_dir: Option<String>,
    #[serde(rename = "data.dir.name")]
    pub data_dir: Option<String>,
    #[serde(rename = "cache.data.segment.size")]
    pub segment_size: Option<u64>,
    #[serde(rename = "cache.data.max.size")]
    pub max_size: Option<u64>,
    #[serde(rename = "scavenger.start.ratio")]
    pub scavenger_start_ratio: Option<f64>,
    #[serde(rename = "scavenger.stop.ratio")]
    pub scavenger_stop_ratio: Option<f64>,
    #[serde(rename = "scavenger.dump.entry.below.start")]
    pub dump_below_start: Option<f64>,
    #[serde(rename = "scavenger.dump.entry.below.stop")]
    pub dump_below_stop: Option<f64>,
    #[serde(rename = "scavenger.dump.entry.below.step")]
    pub dump_below_step: Option<f64>,
    #[serde(rename = "scavenger.run.interval.sec")]
    pub scavenger_run_interval_sec: Option<u64>,
    #[serde(rename = "scavenger.max.segments.before.stall")]
    pub max_segments_before_stall: Option<usize>,
    #[serde(rename = "cache.popularity.number.ranks")]
    pub num_ranks: Option<usize>,
    #[serde(rename = "eviction.slru.number.segments")]
    pub slru_segments: Option<usize>,
    #[serde(rename = "eviction.slru.insert.point")]
    pub slru_insert_point: Option<usize>,
    #[serde(rename = "admission.queue.start.size")]
    pub aq_start_ratio: Option<f64>,
    #[serde(rename = "admission.queue.min.size")]
    pub aq_min_ratio: Option<f64>,
    #[serde(rename = "admission.queue.max.size")]
    pub aq_max_ratio: Option<f64>,
    #[serde(rename = "cache.readmission.hit.count.min")]
    pub readmission_hit_count_min: Option<u8>,
    #[serde(rename = "cache.write.avg.rate.limit")]
    pub write_rate_limit: Option<u64>,
    #[serde(rename = "throughput.check.interval.sec")]
    pub throughput_check_interval_sec: Option<u64>,
    #[serde(rename = "throughput.tolerance.limit")]
    pub throughput_tolerance: Option<f64>,
    #[serde(rename = "throughput.adjustment.steps")]
    pub throughput_adjustment_steps: Option<usize>,
    #[serde(rename = "cache.writes.max.wait.time.ms")]
    pub writes_max_wait_time_ms: Option<u64>,
    #[serde(rename = "index.slots.power")]
    pub index_slots_power: Option<u32>,
    #[serde(rename = "index.data.embedded")]
    pub index_data_embedded: Option<bool>,
    #[serde(rename = "index.data.embedded.size")]
    pub index_data_embedded_size: Option<usize>,
    #[serde(rename = "cache.expire.start.bin.value")]
    pub expire_start_bin_value: Option<u64>,
    #[serde(rename = "cache.expire.multiplier.value")]
    pub expire_multiplier_value: Option<f64>,
    #[serde(rename = "sparse.files.support")]
    pub sparse_files_support: Option<bool>,
    #[serde(rename = "cache.minimum.active.dataset.ratio")]
    pub minimum_active_dataset_ratio: Option<f64>,
    #[serde(rename = "cache.storage.pool.size")]
    pub storage_pool_size: Option<usize>,
    #[serde(rename = "cache.victim.promotion.on.hit")]
    pub victim_promotion_on_hit: Option<bool>,
    #[serde(rename = "cache.eviction.disabled.mode")]
    pub eviction_disabled_mode: Option<bool>,
    #[serde(rename = "file.prefetch.buffer.size")]
    pub file_prefetch_buffer_size: Option<usize>,
    #[serde(rename = "cache.block.writer.block.size")]
    pub block_writer_block_size: Option<usize>,
    #[serde(rename = "cache.random.admission.ratio.start")]
    pub random_admission_ratio_start: Option<f64>,
    #[serde(rename = "cache.random.admission.ratio.stop")]
    pub random_admission_ratio_stop: Option<f64>,
    #[serde(rename = "cache.write.rejection.threshold")]
    pub write_rejection_threshold: Option<f64>,
}

/// TOML configuration file: cache topology plus defaults and per-cache
/// override tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Comma-separated cache names, outermost tier first.
    #[serde(rename = "caches.name.list", default)]
    pub name_list: Option<String>,
    /// Comma-separated cache types (`offheap` or `file`), matching
    /// `caches.name.list` positionally.
    #[serde(rename = "caches.types.list", default)]
    pub types_list: Option<String>,
    /// Unscoped fallback options.
    #[serde(default)]
    pub defaults: CacheOptions,
    /// Per-cache override tables, `[cache.<name>]`.
    #[serde(default)]
    pub cache: BTreeMap<String, CacheOptions>,
}

impl ConfigFile {
    /// Parse a TOML document.
    pub fn parse(text: &str) -> CacheResult<Self> {
        toml::from_str(text).map_err(|e| CacheError::Config(e.to_string()))
    }

    /// Declared cache names and kinds, in declaration order.
    pub fn topology(&self) -> CacheResult<Vec<(String, CacheKind)>> {
        let names: Vec<&str> = self
            .name_list
            .as_deref()
            .unwrap_or("cache")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let types: Vec<&str> = self
            .types_list
            .as_deref()
            .unwrap_or("offheap")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.len() != types.len() {
            return Err(CacheError::Config(
                "caches.name.list and caches.types.list lengths differ".to_string(),
            ));
        }
        names
            .into_iter()
            .zip(types)
            .map(|(n, t)| {
                let kind = match t {
                    "offheap" => CacheKind::Offheap,
                    "file" => CacheKind::File,
                    other => {
                        return Err(CacheError::Config(format!("unknown cache type {:?}", other)))
                    }
                };
                Ok((n.to_string(), kind))
            })
            .collect()
    }

    /// Resolve the configuration for one declared cache, applying the
    /// per-cache table over the defaults table over built-in defaults.
    pub fn resolve(&self, name: &str) -> CacheResult<CacheConfig> {
        let kind = self
            .topology()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, k)| k)
            .ok_or_else(|| CacheError::Config(format!("cache {:?} not declared", name)))?;
        let mut cfg = match kind {
            CacheKind::Offheap => CacheConfig::offheap(name),
            CacheKind::File => CacheConfig::file(name),
        };
        apply(&mut cfg, &self.defaults);
        if let Some(opts) = self.cache.get(name) {
            apply(&mut cfg, opts);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn apply(cfg: &mut CacheConfig, opts: &CacheOptions) {
    macro_rules! set {
        ($field:ident, $opt:expr) => {
            if let Some(v) = &$opt {
                cfg.$field = v.clone();
            }
        };
    }
    if let Some(v) = &opts.victim_name {
        cfg.victim_name = Some(v.clone());
    }
    if let Some(v) = &opts.snapshot_dir {
        cfg.snapshot_dir = PathBuf::from(v);
    }
    if let Some(v) = &opts.data_dir {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Some(v) = opts.segment_size {
        cfg.segment_size = v as usize;
    }
    set!(max_size, opts.max_size);
    set!(scavenger_start_ratio, opts.scavenger_start_ratio);
    set!(scavenger_stop_ratio, opts.scavenger_stop_ratio);
    set!(scavenger_dump_entry_below_start, opts.dump_below_start);
    set!(scavenger_dump_entry_below_stop, opts.dump_below_stop);
    set!(scavenger_dump_entry_below_step, opts.dump_below_step);
    if let Some(v) = opts.scavenger_run_interval_sec {
        cfg.scavenger_run_interval = Duration::from_secs(v);
    }
    set!(
        scavenger_max_segments_before_stall,
        opts.max_segments_before_stall
    );
    set!(num_popularity_ranks, opts.num_ranks);
    set!(slru_num_segments, opts.slru_segments);
    set!(slru_insert_point, opts.slru_insert_point);
    set!(admission_queue_start_size_ratio, opts.aq_start_ratio);
    set!(admission_queue_min_size_ratio, opts.aq_min_ratio);
    set!(admission_queue_max_size_ratio, opts.aq_max_ratio);
    set!(readmission_hit_count_min, opts.readmission_hit_count_min);
    set!(write_rate_limit, opts.write_rate_limit);
    if let Some(v) = opts.throughput_check_interval_sec {
        cfg.throughput_check_interval = Duration::from_secs(v);
    }
    set!(throughput_tolerance, opts.throughput_tolerance);
    set!(
        throughput_adjustment_steps,
        opts.throughput_adjustment_steps
    );
    if let Some(v) = opts.writes_max_wait_time_ms {
        cfg.writes_max_wait_time = Duration::from_millis(v);
    }
    set!(index_slots_power, opts.index_slots_power);
    set!(index_data_embedded, opts.index_data_embedded);
    set!(index_data_embedded_size, opts.index_data_embedded_size);
    set!(expire_start_bin_value, opts.expire_start_bin_value);
    set!(expire_multiplier_value, opts.expire_multiplier_value);
    set!(sparse_files_support, opts.sparse_files_support);
    set!(
        minimum_active_dataset_ratio,
        opts.minimum_active_dataset_ratio
    );
    set!(storage_pool_size, opts.storage_pool_size);
    set!(victim_promotion_on_hit, opts.victim_promotion_on_hit);
    set!(eviction_disabled_mode, opts.eviction_disabled_mode);
    set!(file_prefetch_buffer_size, opts.file_prefetch_buffer_size);
    set!(block_writer_block_size, opts.block_writer_block_size);
    set!(
        random_admission_ratio_start,
        opts.random_admission_ratio_start
    );
    set!(
        random_admission_ratio_stop,
        opts.random_admission_ratio_stop
    );
    set!(write_rejection_threshold, opts.write_rejection_threshold);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offheap_defaults() {
        let cfg = CacheConfig::offheap("mem");
        assert_eq!(cfg.segment_size, 4 * 1024 * 1024);
        assert_eq!(cfg.max_size, 0);
        assert_eq!(cfg.scavenger_start_ratio, 0.95);
        assert_eq!(cfg.scavenger_stop_ratio, 0.90);
        assert_eq!(cfg.num_popularity_ranks, 8);
        assert_eq!(cfg.slru_insert_point, 4);
        assert_eq!(cfg.index_slots_power, 10);
        assert_eq!(cfg.write_rate_limit, 52_428_800);
        assert_eq!(cfg.writes_max_wait_time, Duration::from_millis(10));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_file_defaults() {
        let cfg = CacheConfig::file("disk");
        assert_eq!(cfg.kind, CacheKind::File);
        assert_eq!(cfg.segment_size, 256 * 1024 * 1024);
        assert_eq!(cfg.block_writer_block_size, 4096);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let cfg = CacheConfig::offheap("mem").with_scavenger_ratios(0.5, 0.9);
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_file_victim() {
        let cfg = CacheConfig::file("disk").with_victim("deeper");
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_parse_and_resolve() {
        let text = r#"
"caches.name.list" = "mem,disk"
"caches.types.list" = "offheap,file"

[defaults]
"scavenger.start.ratio" = 0.8
"scavenger.stop.ratio" = 0.7

[cache.mem]
"victim.name" = "disk"
"cache.data.max.size" = 67108864
"index.slots.power" = 4

[cache.disk]
"cache.data.segment.size" = 1048576
"#;
        let file = ConfigFile::parse(text).unwrap();
        let topo = file.topology().unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo[0], ("mem".to_string(), CacheKind::Offheap));
        assert_eq!(topo[1], ("disk".to_string(), CacheKind::File));

        let mem = file.resolve("mem").unwrap();
        assert_eq!(mem.victim_name.as_deref(), Some("disk"));
        assert_eq!(mem.max_size, 64 * 1024 * 1024);
        assert_eq!(mem.index_slots_power, 4);
        assert_eq!(mem.scavenger_start_ratio, 0.8);

        let disk = file.resolve("disk").unwrap();
        assert_eq!(disk.segment_size, 1024 * 1024);
        assert_eq!(disk.scavenger_stop_ratio, 0.7);
        // File default carried through.
        assert_eq!(disk.block_writer_block_size, 4096);
    }

    #[test]
    fn test_resolve_unknown_cache() {
        let file = ConfigFile::parse("\"caches.name.list\" = \"mem\"").unwrap();
        assert!(file.resolve("nope").is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let text = "[defaults]\n\"no.such.key\" = 1\n";
        assert!(ConfigFile::parse(text).is_err());
    }
}
