//! tiercache: a multi-tier, scan-resistant key/value cache.
//!
//! Payload bytes live in fixed-size append-only segments (RAM or one file
//! per segment on disk); a compact, incrementally-rehashed hash index owns
//! all per-key metadata and approximates LRU with in-block SLRU ordering.
//! Space is reclaimed wholesale: a background scavenger picks the segment
//! with the fewest alive items, drops what expired or went cold, rewrites
//! what is still popular, and recycles the segment. A RAM cache can spill
//! its scavenger victims into a file-backed victim tier and pull them back
//! on access.
//!
//! # Architecture
//!
//! ```text
//!        put/get/delete
//!              |
//!        +-----v------+     admission, rank + expire adjustment
//!        |   Cache    |---------------------------------+
//!        +-----+------+                                 |
//!              |                                  +-----v------+
//!        +-----v------+   entry metadata          | Admission  |
//!        |  Storage   |<------------------+       |  Policy    |
//!        |  Engine    |                   |       +------------+
//!        +-----+------+             +-----+------+
//!              | items              |  Memory    |
//!        +-----v------+   probe    |   Index    |
//!        | Segments   |<-----------+-----+------+
//!        +-----+------+                  |
//!              | recycle                 | check/delete
//!        +-----v------------------------ v--+
//!        |            Scavenger             |
//!        +----------------------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tiercache::{Cache, CacheConfig};
//!
//! let cfg = CacheConfig::offheap("demo").with_max_size(64 * 1024 * 1024);
//! let cache = Cache::new(cfg).unwrap();
//! cache.put(b"key", b"value", 0).unwrap();
//! let mut buf = [0u8; 64];
//! let len = cache.get(b"key", &mut buf).unwrap();
//! assert_eq!(&buf[..len], b"value");
//! ```

mod admission;
mod cache;
mod clock;
mod config;
mod error;
mod eviction;
mod index;
mod recycling;
mod scavenger;
mod scheduler;
mod storage;
mod throughput;
mod util;

pub use admission::{AdmissionPolicy, AdmissionPolicyKind, AdmissionQueue, RandomAdmission};
pub use cache::{Cache, CacheBuilder, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CacheKind, CacheOptions, ConfigFile};
pub use error::{CacheError, CacheResult};
pub use eviction::{EvictionPolicy, FifoPolicy, SlruPolicy};
pub use index::format::EntryInfo;
pub use index::{MemoryIndex, MutationResult, ScavengerVerdict};
pub use recycling::{LrcSelector, MinAliveSelector, RecyclingSelector, RecyclingSelectorKind};
pub use scavenger::{ScavengerStats, VictimSink};
pub use storage::reader::{BaseFileDataReader, BaseMemoryDataReader, DataReader};
pub use storage::segment::{ScanItem, SegmentInfo, SegmentState};
pub use storage::writer::{BaseDataWriter, BlockDataWriter, DataWriter};
pub use storage::{SegmentScanner, StorageEngine};
pub use throughput::ThroughputController;
