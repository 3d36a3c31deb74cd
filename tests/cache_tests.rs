//! End-to-end tests for the RAM cache tier.
//!
//! These exercise the public facade the way an embedder would: put/get/
//! delete round trips, expiration, index growth under load, and scavenger
//! pressure, with a manual clock driving time.

use std::sync::Arc;

use tiercache::{Cache, CacheBuilder, CacheConfig, CacheError, Clock, ManualClock};

fn build(cfg: CacheConfig) -> (Cache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = CacheBuilder::new(cfg)
        .clock(clock.clone())
        .background(false)
        .build()
        .expect("failed to build cache");
    (cache, clock)
}

// =============================================================================
// Basic round trips
// =============================================================================

#[test]
fn test_put_then_get_returns_value() {
    let (cache, _) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    cache.put(b"k1", b"v1", 0).unwrap();

    let mut buf = [0u8; 16];
    let n = cache.get(b"k1", &mut buf).expect("k1 missing");
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"v1");

    let stats = cache.stats();
    assert_eq!(stats.gets, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.writes, 1);
}

#[test]
fn test_overwrite_returns_latest_value() {
    let (cache, _) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    cache.put(b"k", b"a", 0).unwrap();
    cache.put(b"k", b"bc", 0).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(cache.get(b"k", &mut buf), Some(2));
    assert_eq!(&buf[..2], b"bc");
    assert_eq!(cache.stats().writes, 2);
    assert_eq!(cache.stats().items, 1);
}

#[test]
fn test_put_delete_get_not_found() {
    let (cache, _) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    cache.put(b"k", b"v", 0).unwrap();
    assert!(cache.delete(b"k"));
    assert!(!cache.delete(b"k"));
    let mut buf = [0u8; 16];
    assert!(cache.get(b"k", &mut buf).is_none());
}

#[test]
fn test_empty_value_round_trip() {
    let (cache, _) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    cache.put(b"empty", b"", 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(cache.get(b"empty", &mut buf), Some(0));
}

// =============================================================================
// Expiration
// =============================================================================

#[test]
fn test_expiration_observed_once() {
    let (cache, clock) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    let expire = clock.now_millis() + 50;
    cache.put(b"dying", b"v", expire).unwrap();

    clock.advance(100);
    let mut buf = [0u8; 16];
    assert!(cache.get(b"dying", &mut buf).is_none());
    assert_eq!(cache.stats().expired_evicted_balance, 1);
    // A second miss does not double-count.
    assert!(cache.get(b"dying", &mut buf).is_none());
    assert_eq!(cache.stats().expired_evicted_balance, 1);
}

#[test]
fn test_insert_with_past_expire_succeeds_then_misses() {
    let (cache, clock) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    let past = clock.now_millis() - 10_000;
    cache.put(b"stale", b"v", past).unwrap();
    let mut buf = [0u8; 16];
    assert!(cache.get(b"stale", &mut buf).is_none());
}

#[test]
fn test_zero_expire_never_expires() {
    let (cache, clock) = build(CacheConfig::offheap("mem").with_max_size(64 * 1024 * 1024));
    cache.put(b"forever", b"v", 0).unwrap();
    clock.advance(u32::MAX as u64);
    let mut buf = [0u8; 16];
    assert_eq!(cache.get(b"forever", &mut buf), Some(1));
}

// =============================================================================
// Index growth under load (rehash)
// =============================================================================

#[test]
fn test_small_table_grows_without_losing_keys() {
    // 16 starting slots; 100k distinct 8B/8B items force repeated
    // incremental rehashes.
    let cfg = CacheConfig::offheap("mem").with_index_slots_power(4);
    let (cache, _) = build(cfg);

    let n: u32 = 100_000;
    for i in 0..n {
        let key = format!("k{i:07}");
        let value = format!("v{i:07}");
        cache
            .put(key.as_bytes(), value.as_bytes(), 0)
            .unwrap_or_else(|e| panic!("put {i} failed: {e}"));
    }
    assert_eq!(cache.stats().items, u64::from(n));

    let mut buf = [0u8; 16];
    for i in 0..n {
        let key = format!("k{i:07}");
        let len = cache
            .get(key.as_bytes(), &mut buf)
            .unwrap_or_else(|| panic!("key {i} lost"));
        assert_eq!(&buf[..len], format!("v{i:07}").as_bytes());
    }
}

// =============================================================================
// Boundaries
// =============================================================================

#[test]
fn test_item_sizes_up_to_segment_boundary() {
    let cfg = CacheConfig::offheap("mem")
        .with_max_size(1024 * 1024)
        .with_segment_size(64 * 1024);
    let (cache, _) = build(cfg);

    // Largest value that still fits one segment with the 8-byte expire
    // prefix and the two length varints.
    let key = b"boundary-key";
    let overhead = 8 + 1 + 3 + key.len(); // expire + klen varint + vlen varint
    let value = vec![1u8; 64 * 1024 - overhead];
    cache.put(key, &value, 0).unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    assert_eq!(cache.get(key, &mut buf), Some(value.len()));

    // One byte past the segment is rejected.
    let too_big = vec![1u8; 64 * 1024];
    assert!(matches!(
        cache.put(b"too-big", &too_big, 0),
        Err(CacheError::WriteRejected)
    ));
}

#[test]
fn test_invalid_arguments() {
    let (cache, _) = build(CacheConfig::offheap("mem"));
    assert!(matches!(
        cache.put(b"", b"v", 0),
        Err(CacheError::InvalidKey)
    ));
    assert!(matches!(
        cache.put_with_rank(b"k", b"v", 0, 100, false),
        Err(CacheError::InvalidRank)
    ));
}

// =============================================================================
// Scavenger pressure
// =============================================================================

#[test]
fn test_scavenger_brings_usage_down() {
    // 4 segments; small index so blocks carry realistic populations. Two
    // ranks so the per-rank active segments cannot pin the whole pool open.
    let mut cfg = CacheConfig::offheap("mem")
        .with_max_size(4 * 1024 * 1024)
        .with_segment_size(1024 * 1024)
        .with_index_slots_power(4);
    cfg.num_popularity_ranks = 2;
    cfg.slru_insert_point = 1;
    let (cache, _) = build(cfg);

    let value = vec![7u8; 1000];
    let mut i = 0u32;
    while cache.usage() < 0.95 {
        cache
            .put(format!("key-{i:06}").as_bytes(), &value, 0)
            .unwrap();
        i += 1;
        assert!(i < 10_000, "never reached start ratio");
    }
    assert_eq!(cache.stats().rejected_writes, 0);

    let recycled = cache.run_scavenger_once();
    assert!(recycled >= 1, "no segment recycled");
    assert!(cache.usage() <= 0.90 + 1e-9);
    assert!(
        cache
            .scavenger_stats()
            .segments_scanned
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    // Writes flow again after the run.
    cache.put(b"after", &value, 0).unwrap();
}

#[test]
fn test_hot_keys_survive_pressure() {
    let mut cfg = CacheConfig::offheap("mem")
        .with_max_size(8 * 1024 * 1024)
        .with_segment_size(1024 * 1024)
        .with_index_slots_power(4);
    cfg.num_popularity_ranks = 4;
    cfg.slru_insert_point = 2;
    let (cache, _) = build(cfg);

    let value = vec![7u8; 1000];
    let hot: Vec<String> = (0..8).map(|i| format!("hot-{i}")).collect();
    for key in &hot {
        cache.put(key.as_bytes(), &value, 0).unwrap();
    }

    let mut buf = vec![0u8; 1024];
    let mut i = 0u32;
    while cache.usage() < 0.95 {
        cache
            .put(format!("cold-{i:06}").as_bytes(), &value, 0)
            .unwrap();
        // Keep the hot set hot.
        for key in &hot {
            cache.get(key.as_bytes(), &mut buf);
        }
        i += 1;
    }
    cache.run_scavenger_once();

    for key in &hot {
        assert!(
            cache.get(key.as_bytes(), &mut buf).is_some(),
            "{key} evicted despite being hot"
        );
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_puts_and_gets() {
    let cfg = CacheConfig::offheap("mem").with_index_slots_power(4);
    let (cache, _) = build(cfg);

    let threads: u32 = 8;
    let per_thread = 2_000u32;
    let mut handles = Vec::new();
    for t in 0..threads {
        let cache = cache.clone();
        handles.push(std::thread::spawn(move || {
            let mut buf = [0u8; 32];
            for i in 0..per_thread {
                let key = format!("t{t}-key-{i:05}");
                let value = format!("t{t}-val-{i:05}");
                cache.put(key.as_bytes(), value.as_bytes(), 0).unwrap();
                let n = cache.get(key.as_bytes(), &mut buf).expect("read own write");
                assert_eq!(&buf[..n], value.as_bytes());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        cache.stats().items,
        u64::from(threads) * u64::from(per_thread)
    );

    let mut buf = [0u8; 32];
    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{t}-key-{i:05}");
            assert!(cache.get(key.as_bytes(), &mut buf).is_some(), "{key} lost");
        }
    }
}
